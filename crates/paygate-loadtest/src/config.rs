//! Run configuration
//!
//! Loaded from TOML; every field has a default so an empty file runs the
//! standard staged profile:
//!
//! ```toml
//! base_url = "http://localhost:8080/api/v1"
//! request_timeout = "30s"
//!
//! [[stages]]
//! duration = "30s"
//! target = 50
//!
//! [thresholds]
//! http_req_duration = ["p(95)<500"]
//! errors = ["rate<0.1"]
//!
//! [weights]
//! pay = 3
//! health = 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::WeightedScenario;
use crate::error::{ConfigError, LoadTestError, Result};
use crate::metrics::{MetricsSink, ERRORS, HTTP_REQ_DURATION};
use crate::scenario::{self, PayloadConfig, BUILTIN_SCENARIOS};
use crate::schedule::{LoadSchedule, Stage};
use crate::threshold::ThresholdSpec;
use crate::transport::validate_base_url;
use crate::vu::PacingRange;

/// Complete load test configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestConfig {
    /// Target API base URL, paths are appended to it
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Ordered load stages
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,

    /// Concurrency the first stage starts from
    #[serde(default)]
    pub start_target: u64,

    /// Threshold expressions keyed by metric name
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, Vec<String>>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Reconciliation period
    #[serde(default = "default_tick")]
    pub tick: String,

    /// Delay between iterations of one virtual user
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Scenario weights; scenarios not listed get weight 1
    #[serde(default)]
    pub weights: BTreeMap<String, u32>,

    /// Request payload defaults
    #[serde(default)]
    pub payload: PayloadConfig,

    /// Seed for reproducible randomness
    #[serde(default)]
    pub seed: Option<u64>,

    /// Idle connections kept per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

/// One stage as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub duration: String,
    pub target: i64,
}

impl StageConfig {
    pub fn new(duration: impl Into<String>, target: i64) -> Self {
        Self {
            duration: duration.into(),
            target,
        }
    }
}

/// Pacing bounds as duration strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_pacing_min")]
    pub min: String,

    #[serde(default = "default_pacing_max")]
    pub max: String,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min: default_pacing_min(),
            max: default_pacing_max(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("30s", 50),
        StageConfig::new("1m", 50),
        StageConfig::new("30s", 100),
        StageConfig::new("1m", 100),
        StageConfig::new("30s", 200),
        StageConfig::new("1m", 200),
        StageConfig::new("30s", 0),
    ]
}

fn default_thresholds() -> BTreeMap<String, Vec<String>> {
    let mut thresholds = BTreeMap::new();
    thresholds.insert(HTTP_REQ_DURATION.to_string(), vec!["p(95)<500".to_string()]);
    thresholds.insert(ERRORS.to_string(), vec!["rate<0.1".to_string()]);
    thresholds
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_tick() -> String {
    "1s".to_string()
}

fn default_pacing_min() -> String {
    "0s".to_string()
}

fn default_pacing_max() -> String {
    "2s".to_string()
}

fn default_max_idle_per_host() -> usize {
    100
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stages: default_stages(),
            start_target: 0,
            thresholds: default_thresholds(),
            request_timeout: default_request_timeout(),
            tick: default_tick(),
            pacing: PacingConfig::default(),
            weights: BTreeMap::new(),
            payload: PayloadConfig::default(),
            seed: None,
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

/// Parse `500ms`, `30s`, `5m` or `1h`
pub fn parse_duration(value: &str) -> std::result::Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let s = value.trim();
    if s.starts_with('-') {
        return Err(invalid("negative durations are not allowed"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let (digits, scale): (&str, fn(u64) -> Duration) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, |m| Duration::from_secs(m.saturating_mul(60)))
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, |h| Duration::from_secs(h.saturating_mul(3600)))
    } else {
        return Err(invalid("expected a unit of ms, s, m or h"));
    };

    digits
        .trim()
        .parse::<u64>()
        .map(scale)
        .map_err(|e| invalid(&e.to_string()))
}

impl LoadTestConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content).map_err(LoadTestError::from)
    }

    /// Single plateau of `vus` users, already at full strength from t = 0
    pub fn constant(mut self, vus: u64, duration: &str, pacing: &str) -> Self {
        self.stages = vec![StageConfig::new(duration, vus as i64)];
        self.start_target = vus;
        self.pacing = PacingConfig {
            min: pacing.to_string(),
            max: pacing.to_string(),
        };
        self
    }

    /// Restrict the run to one scenario
    pub fn only_scenario(mut self, name: &str) -> Self {
        self.weights = BUILTIN_SCENARIOS
            .iter()
            .map(|s| (s.to_string(), u32::from(*s == name)))
            .collect();
        if !BUILTIN_SCENARIOS.contains(&name) {
            self.weights.insert(name.to_string(), 1);
        }
        self
    }

    pub fn build_schedule(&self) -> std::result::Result<LoadSchedule, ConfigError> {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let target = u64::try_from(stage.target).map_err(|_| ConfigError::NegativeTarget {
                    stage: index,
                    target: stage.target,
                })?;
                Ok(Stage::new(parse_duration(&stage.duration)?, target))
            })
            .collect::<std::result::Result<Vec<_>, ConfigError>>()?;

        LoadSchedule::with_start_target(stages, self.start_target)
    }

    /// Parse every threshold and check it against the metrics declared in `sink`
    pub fn build_thresholds(
        &self,
        sink: &MetricsSink,
    ) -> std::result::Result<Vec<ThresholdSpec>, ConfigError> {
        let mut specs = Vec::new();
        for (metric, expressions) in &self.thresholds {
            for expression in expressions {
                let spec = ThresholdSpec::parse(metric, expression)?;
                spec.validate(sink)?;
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Built-in scenarios with their configured weights
    pub fn build_scenarios(&self) -> std::result::Result<Vec<WeightedScenario>, ConfigError> {
        if let Some(unknown) = self
            .weights
            .keys()
            .find(|name| !BUILTIN_SCENARIOS.contains(&name.as_str()))
        {
            return Err(ConfigError::UnknownScenario(unknown.clone()));
        }

        // Zero-weight scenarios are never built, so their payload is not checked
        let mut entries = Vec::with_capacity(BUILTIN_SCENARIOS.len());
        for name in BUILTIN_SCENARIOS {
            let weight = self.weights.get(name).copied().unwrap_or(1);
            if weight > 0 {
                entries.push(WeightedScenario::new(scenario::builtin(name, &self.payload)?, weight));
            }
        }

        if entries.is_empty() {
            return Err(ConfigError::EmptyScenarioSet);
        }
        Ok(entries)
    }

    pub fn pacing_range(&self) -> std::result::Result<PacingRange, ConfigError> {
        let min = parse_duration(&self.pacing.min)?;
        let max = parse_duration(&self.pacing.max)?;
        if min > max {
            return Err(ConfigError::InvalidPacing { min, max });
        }
        Ok(PacingRange::new(min, max))
    }

    pub fn request_timeout(&self) -> std::result::Result<Duration, ConfigError> {
        let timeout = parse_duration(&self.request_timeout)?;
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(timeout)
    }

    pub fn tick(&self) -> std::result::Result<Duration, ConfigError> {
        let tick = parse_duration(&self.tick)?;
        if tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        Ok(tick)
    }

    /// Check everything that can be checked without sending traffic
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validate_base_url(&self.base_url)?;
        self.build_schedule()?;
        self.build_scenarios()?;
        self.pacing_range()?;
        self.request_timeout()?;
        self.tick()?;
        self.build_thresholds(&MetricsSink::with_defaults())?;
        Ok(())
    }
}
