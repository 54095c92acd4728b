//! Error types for load test configuration and execution

use std::time::Duration;
use thiserror::Error;

/// Result type alias for load test operations
pub type Result<T> = std::result::Result<T, LoadTestError>;

/// Errors that reject a run before any virtual user starts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    // === Schedule ===
    /// No stages supplied
    #[error("Load schedule has no stages")]
    EmptySchedule,

    /// Every stage has zero duration
    #[error("Load schedule has zero total duration")]
    ZeroLengthSchedule,

    /// Stage target below zero
    #[error("Stage {stage} has negative target {target}")]
    NegativeTarget { stage: usize, target: i64 },

    /// Duration string could not be parsed
    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    /// Target requested for an instant before the run started
    #[error("Elapsed time precedes the run start")]
    ElapsedBeforeStart,

    // === Scenarios ===
    /// No scenario has a positive weight
    #[error("Scenario set is empty")]
    EmptyScenarioSet,

    /// Weight table names a scenario that does not exist
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// Pay scenario has no channels to choose from
    #[error("Payment channel list is empty")]
    NoPaymentChannels,

    /// Pay amount that is not a positive finite number
    #[error("Payment amount must be positive and finite, got {0}")]
    InvalidAmount(f64),

    // === Execution ===
    /// Pacing range with min above max
    #[error("Invalid pacing range: min {min:?} exceeds max {max:?}")]
    InvalidPacing { min: Duration, max: Duration },

    /// Reconciliation tick of zero
    #[error("Reconciliation tick must be positive")]
    ZeroTick,

    /// Request timeout of zero
    #[error("Request timeout must be positive")]
    ZeroTimeout,

    /// Base URL not parseable
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    // === Thresholds ===
    /// Threshold expression not parseable
    #[error("Invalid threshold '{expression}' on {metric}: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// Threshold names a metric that is not declared
    #[error("Threshold references unknown metric: {0}")]
    UnknownMetric(String),

    /// Aggregation does not apply to the metric kind
    #[error("Aggregation '{aggregation}' is not valid for {kind} metric {metric}")]
    IncompatibleThreshold {
        metric: String,
        aggregation: String,
        kind: String,
    },

    // === Parsing ===
    /// Configuration file could not be decoded
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Top-level load test errors
#[derive(Error, Debug)]
pub enum LoadTestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LoadTestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
