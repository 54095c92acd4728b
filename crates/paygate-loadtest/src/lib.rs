//! # Payment Gateway Load Testing
//!
//! Staged virtual-user load generation against a payment gateway HTTP API.
//!
//! ## Features
//!
//! - **Load Schedules**: ramp and plateau stages with linear interpolation
//! - **Virtual Users**: one tokio task per simulated client, retired gracefully
//! - **Weighted Scenarios**: health, channel listing, payment and query requests
//! - **Metrics Sink**: concurrent counters, rates and HDR latency histograms
//! - **Thresholds**: k6-style pass/fail criteria evaluated after the run
//!
//! ## Architecture
//!
//! ```text
//!   LoadSchedule ──► VirtualUserScheduler ──► VirtualUser (xN)
//!                                                 │
//!                                                 ▼
//!                                        ScenarioDispatcher ──► Transport ──► target
//!                                                 │
//!                                                 ▼
//!                                           MetricsSink ──► ThresholdEvaluator
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run the default staged profile
//! cargo run --package paygate-loadtest -- --target http://localhost:8080/api/v1
//!
//! # Run a profile from a file
//! cargo run --package paygate-loadtest -- --config loadtest.toml --output report.json
//!
//! # Fixed concurrency for five minutes
//! cargo run --package paygate-loadtest -- constant --vus 100 --duration 5m
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod random;
pub mod runner;
pub mod scenario;
pub mod schedule;
pub mod scheduler;
pub mod threshold;
pub mod transport;
pub mod vu;

pub use config::LoadTestConfig;
pub use dispatcher::{Outcome, ScenarioDispatcher, WeightedScenario};
pub use error::{ConfigError, LoadTestError, Result};
pub use metrics::{MetricKind, MetricsSink, MetricsSnapshot, MetricsSummary};
pub use random::{RandomSource, RandomSourceFactory};
pub use runner::{LoadTestRunner, RunReport};
pub use scenario::Scenario;
pub use schedule::{LoadSchedule, Stage};
pub use scheduler::{SchedulerReport, VirtualUserScheduler};
pub use threshold::{ThresholdEvaluator, ThresholdSpec, Verdict};
pub use transport::{HttpRequest, HttpTransport, RequestFailure, Transport};
pub use vu::VuState;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::LoadTestConfig;
    pub use crate::error::{ConfigError, LoadTestError, Result};
    pub use crate::metrics::MetricsSink;
    pub use crate::runner::{LoadTestRunner, RunReport};
    pub use crate::schedule::{LoadSchedule, Stage};
    pub use crate::threshold::{ThresholdSpec, Verdict};
}
