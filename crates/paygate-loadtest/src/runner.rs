//! Load test runner
//!
//! Wires a validated configuration into a scheduler, runs it and turns the
//! final metrics into a report with a pass/fail verdict.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::LoadTestConfig;
use crate::dispatcher::ScenarioDispatcher;
use crate::error::Result;
use crate::metrics::{MetricsSink, MetricsSnapshot, MetricsSummary, ITERATIONS};
use crate::random::StdRandomFactory;
use crate::schedule::LoadSchedule;
use crate::scheduler::{SchedulerReport, VirtualUserScheduler};
use crate::threshold::{ThresholdEvaluator, ThresholdSpec, Verdict};
use crate::transport::{HttpTransport, Transport};

/// Load test runner
pub struct LoadTestRunner {
    config: LoadTestConfig,
    metrics: Arc<MetricsSink>,
    thresholds: Vec<ThresholdSpec>,
    scheduler: VirtualUserScheduler,
}

impl LoadTestRunner {
    /// Create a runner that talks HTTP to `config.base_url`
    pub fn new(config: LoadTestConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            &config.base_url,
            config.request_timeout()?,
            config.max_idle_per_host,
        )?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a runner over a custom transport
    ///
    /// Every configuration error surfaces here, before any user is spawned.
    pub fn with_transport(config: LoadTestConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let schedule = config.build_schedule()?;
        let metrics = Arc::new(MetricsSink::with_defaults());
        let thresholds = config.build_thresholds(&metrics)?;

        let dispatcher = ScenarioDispatcher::new(
            config.build_scenarios()?,
            transport,
            metrics.clone(),
            config.request_timeout()?,
        )?;

        let scheduler = VirtualUserScheduler::new(
            schedule,
            Arc::new(dispatcher),
            config.pacing_range()?,
            config.tick()?,
            Arc::new(StdRandomFactory::new(config.seed)),
        )?;

        Ok(Self {
            config,
            metrics,
            thresholds,
            scheduler,
        })
    }

    /// Token that stops the run early; the partial run is still evaluated
    pub fn cancel_token(&self) -> CancellationToken {
        self.scheduler.cancel_token()
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    pub fn schedule(&self) -> &LoadSchedule {
        self.scheduler.schedule()
    }

    pub fn thresholds(&self) -> &[ThresholdSpec] {
        &self.thresholds
    }

    /// Run the load test
    pub async fn run(self) -> RunReport {
        info!(
            "Starting load test against {} for {:?} ({} thresholds)",
            self.config.base_url,
            self.schedule().total_duration(),
            self.thresholds.len()
        );

        self.metrics.mark_started();
        let scheduler = self.scheduler.run().await;
        self.metrics.mark_finished();

        let snapshot = self.metrics.snapshot();
        let verdict = ThresholdEvaluator::evaluate(&snapshot, &self.thresholds);

        info!(
            "Load test complete: {} iterations by {} users, verdict {}",
            snapshot.counter(ITERATIONS),
            scheduler.total_spawned,
            if verdict.pass { "PASS" } else { "FAIL" }
        );

        RunReport {
            base_url: self.config.base_url,
            summary: snapshot.summary(),
            verdict,
            users_spawned: scheduler.total_spawned,
            peak_active: scheduler.peak_active,
            duration_secs: scheduler.elapsed.as_secs_f64(),
            cancelled: scheduler.cancelled,
            snapshot,
            scheduler,
        }
    }
}

/// Final result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub base_url: String,
    pub summary: MetricsSummary,
    pub verdict: Verdict,
    pub users_spawned: u64,
    pub peak_active: u64,
    pub duration_secs: f64,
    pub cancelled: bool,
    #[serde(skip)]
    pub snapshot: MetricsSnapshot,
    #[serde(skip)]
    pub scheduler: SchedulerReport,
}

impl RunReport {
    /// Process exit status: 0 when every threshold passed
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// Write the report as pretty JSON
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Print formatted report
    pub fn print_report(&self) {
        self.summary.print_report();

        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║                         THRESHOLDS                           ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Target:   {}", self.base_url);
        println!(
            "║ Users:    {} spawned, {} peak{}",
            self.users_spawned,
            self.peak_active,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        for result in &self.verdict.evaluated {
            let observed = result
                .observed
                .map(|v| format!("{:.4}", v))
                .unwrap_or_else(|| "no data".to_string());
            println!(
                "║ {} {:20} {:16} observed {}",
                if result.passed { "✅" } else { "❌" },
                result.metric,
                result.expression,
                observed
            );
        }
        println!("╚══════════════════════════════════════════════════════════════╝");

        if self.verdict.pass {
            println!("✅ All thresholds passed");
        } else {
            println!("❌ {} threshold(s) failed", self.verdict.failures.len());
        }
    }
}
