//! Virtual users and their lifecycle
//!
//! ```text
//!   Idle ──spawn──► Running ──stop──► Stopping ──loop exit──► Terminated
//! ```
//!
//! Transitions only move one step forward. A stop request is honored at the
//! next iteration boundary; an in-flight scenario always runs to completion.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatcher::ScenarioDispatcher;
use crate::random::RandomSource;

/// Lifecycle state of a virtual user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Terminated = 3,
}

impl VuState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Terminated,
        }
    }

    /// State reachable in one step, if any
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Running),
            Self::Running => Some(Self::Stopping),
            Self::Stopping => Some(Self::Terminated),
            Self::Terminated => None,
        }
    }
}

/// Lifecycle cell shared by a virtual user and its scheduler handle
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(VuState::Idle as u8),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to its successor; fails if the current state differs
    pub fn advance(&self, from: VuState) -> Result<VuState, VuState> {
        let to = from.next().ok_or(from)?;
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| to)
            .map_err(VuState::from_u8)
    }
}

/// Inclusive range the pacing delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingRange {
    pub min: Duration,
    pub max: Duration,
}

impl PacingRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn sample(&self, rng: &mut dyn RandomSource) -> Duration {
        rng.next_duration(self.min, self.max)
    }
}

impl Default for PacingRange {
    fn default() -> Self {
        Self::new(Duration::ZERO, Duration::from_secs(2))
    }
}

/// What a virtual user did before it terminated
#[derive(Debug, Clone)]
pub struct VirtualUserReport {
    pub id: u64,
    pub iterations: u64,
    pub failures: u64,
    pub started_at: Instant,
    /// Completion instant of the last outcome this user recorded
    pub last_outcome_at: Option<Instant>,
    pub terminated_at: Instant,
}

/// One simulated client
pub struct VirtualUser {
    id: u64,
    dispatcher: Arc<ScenarioDispatcher>,
    rng: Box<dyn RandomSource>,
    pacing: PacingRange,
    stop: CancellationToken,
    lifecycle: Arc<Lifecycle>,
}

impl VirtualUser {
    pub fn new(
        id: u64,
        dispatcher: Arc<ScenarioDispatcher>,
        rng: Box<dyn RandomSource>,
        pacing: PacingRange,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id,
            dispatcher,
            rng,
            pacing,
            stop,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    /// Enter `Running` and start the loop on the tokio runtime
    pub fn spawn(self) -> VirtualUserHandle {
        let lifecycle = self.lifecycle.clone();
        let stop = self.stop.clone();
        let id = self.id;

        // Running before the task is polled, so a stop can never find it Idle
        let _ = lifecycle.advance(VuState::Idle);
        let join = tokio::spawn(self.run());

        VirtualUserHandle {
            id,
            lifecycle,
            stop,
            join,
        }
    }

    async fn run(mut self) -> VirtualUserReport {
        let started_at = Instant::now();
        let mut iterations = 0u64;
        let mut failures = 0u64;
        let mut last_outcome_at = None;

        while !self.stop.is_cancelled() {
            let outcome = self.dispatcher.execute(self.rng.as_mut()).await;
            iterations += 1;
            if !outcome.success {
                failures += 1;
            }
            last_outcome_at = Some(outcome.completed_at);

            if self.stop.is_cancelled() {
                break;
            }

            let delay = self.pacing.sample(self.rng.as_mut());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => break,
            }
        }

        // A run-level cancel reaches us without the scheduler marking Stopping
        let _ = self.lifecycle.advance(VuState::Running);
        let _ = self.lifecycle.advance(VuState::Stopping);
        let terminated_at = Instant::now();

        debug!("Virtual user {} terminated after {} iterations", self.id, iterations);

        VirtualUserReport {
            id: self.id,
            iterations,
            failures,
            started_at,
            last_outcome_at,
            terminated_at,
        }
    }
}

/// Scheduler-side handle to a running virtual user
pub struct VirtualUserHandle {
    id: u64,
    lifecycle: Arc<Lifecycle>,
    stop: CancellationToken,
    join: JoinHandle<VirtualUserReport>,
}

impl VirtualUserHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.lifecycle.state()
    }

    /// Mark `Stopping` and signal the loop; the current scenario still completes
    pub fn request_stop(&self) {
        let _ = self.lifecycle.advance(VuState::Running);
        self.stop.cancel();
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to exit
    pub async fn join(self) -> Option<VirtualUserReport> {
        match self.join.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Virtual user {} task failed: {}", self.id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{builtin_entries, FakeTransport};
    use crate::metrics::{MetricsSink, ITERATIONS};
    use crate::random::SequenceRandom;

    fn dispatcher(latency: Duration) -> Arc<ScenarioDispatcher> {
        Arc::new(
            ScenarioDispatcher::new(
                builtin_entries(),
                Arc::new(FakeTransport::ok(latency)),
                Arc::new(MetricsSink::with_defaults()),
                Duration::from_secs(30),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), VuState::Idle);
        assert_eq!(lifecycle.advance(VuState::Idle), Ok(VuState::Running));
        assert_eq!(lifecycle.advance(VuState::Idle), Err(VuState::Running));
        assert_eq!(lifecycle.advance(VuState::Running), Ok(VuState::Stopping));
        assert_eq!(lifecycle.advance(VuState::Stopping), Ok(VuState::Terminated));
        assert_eq!(lifecycle.advance(VuState::Terminated), Err(VuState::Terminated));
        assert_eq!(lifecycle.state(), VuState::Terminated);
    }

    #[test]
    fn test_pacing_range() {
        let mut rng = SequenceRandom::new(vec![0.25]);
        let pacing = PacingRange::default();
        assert_eq!(pacing.sample(&mut rng), Duration::from_millis(500));
        assert_eq!(
            PacingRange::fixed(Duration::from_millis(100)).sample(&mut rng),
            Duration::from_millis(100)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_request() {
        let d = dispatcher(Duration::from_millis(500));
        let stop = CancellationToken::new();
        let user = VirtualUser::new(
            1,
            d.clone(),
            Box::new(SequenceRandom::new(vec![0.5])),
            PacingRange::fixed(Duration::from_millis(100)),
            stop.clone(),
        );
        let handle = user.spawn();
        assert_eq!(handle.state(), VuState::Running);

        // Mid-request: first call started at t=0 and completes at t=500ms
        tokio::time::sleep(Duration::from_millis(250)).await;
        let stop_requested_at = Instant::now();
        handle.request_stop();
        assert_eq!(handle.state(), VuState::Stopping);

        let lifecycle = handle.lifecycle.clone();
        let report = handle.join().await.unwrap();
        assert_eq!(lifecycle.state(), VuState::Terminated);
        assert_eq!(report.iterations, 1);

        let last = report.last_outcome_at.unwrap();
        assert!(last > stop_requested_at);
        assert!(last <= report.terminated_at);
        assert_eq!(d.metrics().snapshot().counter(ITERATIONS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_pacing_is_immediate() {
        let d = dispatcher(Duration::from_millis(10));
        let stop = CancellationToken::new();
        let user = VirtualUser::new(
            2,
            d,
            Box::new(SequenceRandom::new(vec![0.5])),
            PacingRange::fixed(Duration::from_secs(10)),
            stop.clone(),
        );
        let handle = user.spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.request_stop();
        let report = handle.join().await.unwrap();

        assert_eq!(report.iterations, 1);
        assert!(report.terminated_at - report.started_at < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let transport = FakeTransport::ok(Duration::from_millis(10))
            .with_status("/health", 503)
            .with_status("/channels", 503)
            .with_status("/pay", 503)
            .with_status("/query", 503);
        let d = Arc::new(
            ScenarioDispatcher::new(
                builtin_entries(),
                Arc::new(transport),
                Arc::new(MetricsSink::with_defaults()),
                Duration::from_secs(30),
            )
            .unwrap(),
        );
        let stop = CancellationToken::new();
        let handle = VirtualUser::new(
            3,
            d,
            Box::new(SequenceRandom::new(vec![0.1, 0.7])),
            PacingRange::fixed(Duration::from_millis(90)),
            stop.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        stop.cancel();
        let report = handle.join().await.unwrap();

        assert_eq!(report.iterations, report.failures);
        assert!(report.iterations >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_terminates() {
        let parent = CancellationToken::new();
        let handle = VirtualUser::new(
            4,
            dispatcher(Duration::from_millis(10)),
            Box::new(SequenceRandom::new(vec![0.5])),
            PacingRange::fixed(Duration::from_millis(100)),
            parent.child_token(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(300)).await;
        parent.cancel();
        let lifecycle = handle.lifecycle.clone();
        let report = handle.join().await.unwrap();
        assert_eq!(lifecycle.state(), VuState::Terminated);
        assert!(report.iterations >= 2);
    }
}
