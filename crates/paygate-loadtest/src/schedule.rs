//! Load schedule: target concurrency as a function of elapsed time
//!
//! A schedule is an ordered list of stages. Each stage moves the target from
//! the value it inherits (the previous stage's target, or `start_target` for
//! the first stage) to its own target over its duration:
//!
//! ```text
//!  target
//!   200 ┤                         ╭─────╮
//!   100 ┤             ╭─────╮    ╱       ╲
//!    50 ┤   ╭─────╮  ╱       ╲──╯         ╲
//!     0 ┼──╯       ╲╱                      ╲──
//!       └────────────────────────────────────► elapsed
//! ```
//!
//! Past the end of the last stage the target is 0.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ConfigError;

/// One schedule segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// How long the stage lasts
    pub duration: Duration,

    /// Concurrency reached at the end of the stage
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Whether a stage moves the target or holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ramp,
    Plateau,
}

/// Position of an elapsed time inside the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageProgress {
    pub index: usize,
    pub kind: StageKind,
    pub from: u64,
    pub to: u64,
}

/// Immutable sequence of stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSchedule {
    stages: Vec<Stage>,
    start_target: u64,
    total: Duration,
}

impl LoadSchedule {
    /// Build a schedule starting from zero concurrency
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        Self::with_start_target(stages, 0)
    }

    /// Build a schedule whose first stage starts at `start_target`
    pub fn with_start_target(stages: Vec<Stage>, start_target: u64) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }

        let total: Duration = stages.iter().map(|s| s.duration).sum();
        if total.is_zero() {
            return Err(ConfigError::ZeroLengthSchedule);
        }

        Ok(Self {
            stages,
            start_target,
            total,
        })
    }

    /// Single plateau holding `target` users for `duration`
    pub fn constant(target: u64, duration: Duration) -> Result<Self, ConfigError> {
        Self::with_start_target(vec![Stage::new(duration, target)], target)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_target(&self) -> u64 {
        self.start_target
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target reached anywhere in the schedule
    pub fn peak_target(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, u64::max)
    }

    /// Target concurrency at `elapsed` since run start
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let mut stage_start = Duration::ZERO;
        let mut previous = self.start_target;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                if stage.target == previous {
                    return previous;
                }
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let diff = stage.target as f64 - previous as f64;
                return (previous as f64 + diff * progress) as u64;
            }
            stage_start = stage_end;
            previous = stage.target;
        }

        0
    }

    /// Target concurrency at `now` for a run started at `start`
    pub fn target_at_instant(&self, start: Instant, now: Instant) -> Result<u64, ConfigError> {
        now.checked_duration_since(start)
            .map(|elapsed| self.target_at(elapsed))
            .ok_or(ConfigError::ElapsedBeforeStart)
    }

    /// Stage containing `elapsed`, or `None` once the schedule is over
    pub fn stage_at(&self, elapsed: Duration) -> Option<StageProgress> {
        let mut stage_start = Duration::ZERO;
        let mut previous = self.start_target;

        for (index, stage) in self.stages.iter().enumerate() {
            stage_start += stage.duration;
            if elapsed < stage_start {
                let kind = if stage.target == previous {
                    StageKind::Plateau
                } else {
                    StageKind::Ramp
                };
                return Some(StageProgress {
                    index,
                    kind,
                    from: previous,
                    to: stage.target,
                });
            }
            previous = stage.target;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn staged() -> LoadSchedule {
        LoadSchedule::new(vec![
            Stage::new(secs(30), 50),
            Stage::new(secs(60), 50),
            Stage::new(secs(30), 100),
            Stage::new(secs(30), 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_schedule_rejected() {
        assert_eq!(LoadSchedule::new(vec![]), Err(ConfigError::EmptySchedule));
    }

    #[test]
    fn test_zero_length_schedule_rejected() {
        let result = LoadSchedule::new(vec![Stage::new(Duration::ZERO, 10)]);
        assert_eq!(result, Err(ConfigError::ZeroLengthSchedule));
    }

    #[test]
    fn test_ramp_interpolates_linearly() {
        let schedule = staged();
        assert_eq!(schedule.target_at(secs(0)), 0);
        assert_eq!(schedule.target_at(secs(15)), 25);
        assert_eq!(schedule.target_at(Duration::from_millis(29_999)), 49);
        assert_eq!(schedule.target_at(secs(30)), 50);
        assert_eq!(schedule.target_at(secs(105)), 75);
        assert_eq!(schedule.target_at(secs(135)), 50);
    }

    #[test]
    fn test_plateau_holds() {
        let schedule = staged();
        for t in 30..90 {
            assert_eq!(schedule.target_at(secs(t)), 50);
        }
    }

    #[test]
    fn test_target_after_end_is_zero() {
        let schedule = LoadSchedule::new(vec![Stage::new(secs(10), 10)]).unwrap();
        assert_eq!(schedule.target_at(secs(10)), 0);
        assert_eq!(schedule.target_at(secs(3600)), 0);
    }

    #[test]
    fn test_start_target() {
        let schedule = LoadSchedule::constant(100, secs(300)).unwrap();
        assert_eq!(schedule.target_at(secs(0)), 100);
        assert_eq!(schedule.target_at(secs(299)), 100);
        assert_eq!(schedule.stage_at(secs(1)).unwrap().kind, StageKind::Plateau);
        assert_eq!(schedule.peak_target(), 100);
    }

    #[test]
    fn test_zero_length_stage_jumps() {
        let schedule = LoadSchedule::new(vec![
            Stage::new(Duration::ZERO, 20),
            Stage::new(secs(10), 20),
        ])
        .unwrap();
        assert_eq!(schedule.target_at(secs(0)), 20);
        assert_eq!(schedule.target_at(secs(5)), 20);
    }

    #[test]
    fn test_stage_at() {
        let schedule = staged();
        let first = schedule.stage_at(secs(1)).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.kind, StageKind::Ramp);
        assert_eq!((first.from, first.to), (0, 50));

        let last = schedule.stage_at(secs(140)).unwrap();
        assert_eq!(last.index, 3);
        assert_eq!((last.from, last.to), (100, 0));

        assert!(schedule.stage_at(secs(150)).is_none());
        assert_eq!(schedule.total_duration(), secs(150));
        assert_eq!(schedule.peak_target(), 100);
    }

    #[test]
    fn test_instant_before_start_rejected() {
        let schedule = staged();
        let start = Instant::now() + secs(5);
        let now = Instant::now();
        assert_eq!(
            schedule.target_at_instant(start, now),
            Err(ConfigError::ElapsedBeforeStart)
        );
        assert_eq!(schedule.target_at_instant(now, now + secs(15)), Ok(25));
    }

    proptest! {
        #[test]
        fn prop_ramp_monotonic(
            from in 0u64..500,
            to in 0u64..500,
            duration_ms in 1u64..600_000,
            a in 0.0f64..1.0,
            b in 0.0f64..1.0,
        ) {
            let schedule = LoadSchedule::with_start_target(
                vec![Stage::new(Duration::from_millis(duration_ms), to)],
                from,
            ).unwrap();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let t_lo = Duration::from_secs_f64(duration_ms as f64 * lo / 1000.0);
            let t_hi = Duration::from_secs_f64(duration_ms as f64 * hi / 1000.0);
            prop_assume!(t_hi < Duration::from_millis(duration_ms));
            let v_lo = schedule.target_at(t_lo);
            let v_hi = schedule.target_at(t_hi);

            if to >= from {
                prop_assert!(v_lo <= v_hi);
            } else {
                prop_assert!(v_lo >= v_hi);
            }
            prop_assert!(v_lo >= from.min(to) && v_lo <= from.max(to));
        }

        #[test]
        fn prop_plateau_constant(target in 0u64..1000, duration_ms in 1u64..600_000, f in 0.0f64..1.0) {
            let schedule = LoadSchedule::with_start_target(
                vec![Stage::new(Duration::from_millis(duration_ms), target)],
                target,
            ).unwrap();
            let t = Duration::from_secs_f64(duration_ms as f64 * f / 1000.0);
            prop_assume!(t < Duration::from_millis(duration_ms));
            prop_assert_eq!(schedule.target_at(t), target);
        }
    }
}
