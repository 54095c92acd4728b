//! Virtual user scheduler
//!
//! Every tick the scheduler compares the running population with the
//! schedule's target and spawns or retires users to close the gap. Retired
//! users are the most recently spawned ones; they leave the active set at
//! once but keep running until their in-flight scenario completes.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::ScenarioDispatcher;
use crate::error::ConfigError;
use crate::random::RandomSourceFactory;
use crate::schedule::{LoadSchedule, StageKind};
use crate::vu::{PacingRange, VirtualUser, VirtualUserHandle, VirtualUserReport};

/// Default reconciliation period
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// One reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub elapsed: Duration,
    pub target: u64,
    pub active_before: u64,
    pub spawned: u64,
    pub retired: u64,
    pub active_after: u64,
}

/// Population history of a finished run
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    pub users: Vec<VirtualUserReport>,
    pub reconciliations: Vec<Reconciliation>,
    pub peak_active: u64,
    pub total_spawned: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// Users the scheduler currently tracks
struct Population {
    active: Vec<VirtualUserHandle>,
    draining: Vec<VirtualUserHandle>,
    finished: Vec<VirtualUserReport>,
    next_id: u64,
}

impl Population {
    fn new() -> Self {
        Self {
            active: Vec::new(),
            draining: Vec::new(),
            finished: Vec::new(),
            next_id: 0,
        }
    }

    fn active(&self) -> u64 {
        self.active.len() as u64
    }

    /// Collect users whose loops have exited
    async fn reap(&mut self) {
        let (done, draining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.draining)
            .into_iter()
            .partition(|h| h.is_finished());
        self.draining = draining;
        for handle in done {
            if let Some(report) = handle.join().await {
                self.finished.push(report);
            }
        }

        // An active user only exits on its own if its task panicked
        let (done, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|h| h.is_finished());
        self.active = active;
        for handle in done {
            warn!("Virtual user {} exited without a stop request", handle.id());
            if let Some(report) = handle.join().await {
                self.finished.push(report);
            }
        }
    }

    /// Stop the newest active user
    fn retire_newest(&mut self) -> bool {
        match self.active.pop() {
            Some(handle) => {
                handle.request_stop();
                self.draining.push(handle);
                true
            }
            None => false,
        }
    }

    /// Stop every active user and wait for all of them to terminate
    async fn shutdown(mut self) -> Vec<VirtualUserReport> {
        while self.retire_newest() {}

        let joins = self.draining.into_iter().map(|h| h.join());
        let reports = futures::future::join_all(joins).await;
        self.finished.extend(reports.into_iter().flatten());

        self.finished.sort_by_key(|r| r.id);
        self.finished
    }
}

/// Drives the virtual user population along a load schedule
pub struct VirtualUserScheduler {
    schedule: LoadSchedule,
    dispatcher: Arc<ScenarioDispatcher>,
    pacing: PacingRange,
    tick: Duration,
    rng_factory: Arc<dyn RandomSourceFactory>,
    cancel: CancellationToken,
}

impl VirtualUserScheduler {
    pub fn new(
        schedule: LoadSchedule,
        dispatcher: Arc<ScenarioDispatcher>,
        pacing: PacingRange,
        tick: Duration,
        rng_factory: Arc<dyn RandomSourceFactory>,
    ) -> Result<Self, ConfigError> {
        if tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if pacing.min > pacing.max {
            return Err(ConfigError::InvalidPacing {
                min: pacing.min,
                max: pacing.max,
            });
        }

        Ok(Self {
            schedule,
            dispatcher,
            pacing,
            tick,
            rng_factory,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that ends the run early when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn schedule(&self) -> &LoadSchedule {
        &self.schedule
    }

    /// Run the schedule to completion or cancellation
    pub async fn run(self) -> SchedulerReport {
        let start = Instant::now();
        let deadline = start + self.schedule.total_duration();

        info!(
            "Starting schedule: {} stages over {:?}, peak {} users",
            self.schedule.stages().len(),
            self.schedule.total_duration(),
            self.schedule.peak_target()
        );

        let mut interval = tokio::time::interval_at(start, self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let end = tokio::time::sleep_until(deadline);
        tokio::pin!(end);

        let mut population = Population::new();
        let mut reconciliations = Vec::new();
        let mut peak_active = 0u64;
        let mut current_stage = None;

        let cancelled = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break true,
                _ = &mut end => break false,
                _ = interval.tick() => {
                    let elapsed = start.elapsed();

                    if let Some(stage) = self.schedule.stage_at(elapsed) {
                        if current_stage != Some(stage.index) {
                            current_stage = Some(stage.index);
                            match stage.kind {
                                StageKind::Ramp => info!(
                                    "Stage {}: ramping {} -> {} users",
                                    stage.index + 1, stage.from, stage.to
                                ),
                                StageKind::Plateau => info!(
                                    "Stage {}: holding {} users",
                                    stage.index + 1, stage.to
                                ),
                            }
                        }
                    }

                    population.reap().await;
                    let step = self.reconcile(&mut population, elapsed);
                    peak_active = peak_active.max(step.active_after);
                    reconciliations.push(step);
                }
            }
        };

        if cancelled {
            info!("Run cancelled, stopping {} virtual users", population.active());
        } else {
            info!("Schedule complete, stopping {} virtual users", population.active());
        }

        let total_spawned = population.next_id;
        let users = population.shutdown().await;
        let elapsed = start.elapsed();

        info!("All virtual users terminated after {:?}", elapsed);

        SchedulerReport {
            users,
            reconciliations,
            peak_active,
            total_spawned,
            elapsed,
            cancelled,
        }
    }

    fn reconcile(&self, population: &mut Population, elapsed: Duration) -> Reconciliation {
        let target = self.schedule.target_at(elapsed);
        let active_before = population.active();
        let mut spawned = 0;
        let mut retired = 0;

        while population.active() < target {
            let id = population.next_id;
            population.next_id += 1;

            let user = VirtualUser::new(
                id,
                self.dispatcher.clone(),
                self.rng_factory.for_user(id),
                self.pacing,
                self.cancel.child_token(),
            );
            population.active.push(user.spawn());
            spawned += 1;
        }

        while population.active() > target && population.retire_newest() {
            retired += 1;
        }

        let step = Reconciliation {
            elapsed,
            target,
            active_before,
            spawned,
            retired,
            active_after: population.active(),
        };

        if spawned > 0 || retired > 0 {
            debug!(
                "Reconciled at {:?}: target {}, {} -> {} (+{} -{}), {} draining",
                elapsed,
                target,
                active_before,
                step.active_after,
                spawned,
                retired,
                population.draining.len()
            );
        }

        step
    }
}
