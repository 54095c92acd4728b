//! Metrics sink shared by every virtual user
//!
//! Three metric kinds, mirroring the k6 vocabulary the thresholds are written
//! in: counters, rates (share of `true` observations) and trends (latency
//! distributions kept as HDR histograms in microseconds).

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Latency of every HTTP call, in the trend unit
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Number of HTTP calls issued
pub const HTTP_REQS: &str = "http_reqs";
/// Number of scenario executions
pub const ITERATIONS: &str = "iterations";
/// Share of failed scenario executions
pub const ERRORS: &str = "errors";
/// Number of pay scenario executions
pub const PAYMENT_REQUESTS: &str = "payment_requests";
/// Number of query scenario executions
pub const QUERY_REQUESTS: &str = "query_requests";

/// Highest trackable latency: one hour in microseconds
const HISTOGRAM_MAX_US: u64 = 3_600_000_000;

/// Kind of a named metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Rate => write!(f, "rate"),
            Self::Trend => write!(f, "trend"),
        }
    }
}

#[derive(Debug, Default)]
struct RateCell {
    passes: AtomicU64,
    total: AtomicU64,
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, HISTOGRAM_MAX_US, 3).expect("static histogram bounds are valid")
}

/// Concurrent accumulator for counters, rates and trends
#[derive(Debug, Default)]
pub struct MetricsSink {
    counters: DashMap<String, AtomicU64>,
    rates: DashMap<String, RateCell>,
    trends: DashMap<String, Mutex<Histogram<u64>>>,
    error_counts: DashMap<String, AtomicU64>,
    start_time: RwLock<Option<Instant>>,
    finish_time: RwLock<Option<Instant>>,
}

impl MetricsSink {
    /// Empty sink with no declared metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink with the load test's standard metrics declared
    pub fn with_defaults() -> Self {
        let sink = Self::new();
        sink.declare(PAYMENT_REQUESTS, MetricKind::Counter);
        sink.declare(QUERY_REQUESTS, MetricKind::Counter);
        sink.declare(HTTP_REQS, MetricKind::Counter);
        sink.declare(ITERATIONS, MetricKind::Counter);
        sink.declare(ERRORS, MetricKind::Rate);
        sink.declare(HTTP_REQ_DURATION, MetricKind::Trend);
        sink
    }

    /// Declare a metric so it appears in snapshots before its first write
    pub fn declare(&self, name: &str, kind: MetricKind) {
        match kind {
            MetricKind::Counter => {
                self.counters.entry(name.to_string()).or_default();
            }
            MetricKind::Rate => {
                self.rates.entry(name.to_string()).or_default();
            }
            MetricKind::Trend => {
                self.trends
                    .entry(name.to_string())
                    .or_insert_with(|| Mutex::new(new_histogram()));
            }
        }
    }

    /// Kind of a declared (or already written) metric
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        if self.counters.contains_key(name) {
            Some(MetricKind::Counter)
        } else if self.rates.contains_key(name) {
            Some(MetricKind::Rate)
        } else if self.trends.contains_key(name) {
            Some(MetricKind::Trend)
        } else {
            None
        }
    }

    /// Mark the start of the measured window
    pub fn mark_started(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Close the measured window; later snapshots report a fixed elapsed time
    pub fn mark_finished(&self) {
        *self.finish_time.write() = Some(Instant::now());
    }

    /// Add 1 to a counter
    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    /// Add `delta` to a counter
    pub fn add(&self, name: &str, delta: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Add one boolean observation to a rate
    pub fn record(&self, name: &str, value: bool) {
        let bump = |cell: &RateCell| {
            // total first, so a reader never sees more passes than observations
            cell.total.fetch_add(1, Ordering::SeqCst);
            if value {
                cell.passes.fetch_add(1, Ordering::SeqCst);
            }
        };

        if let Some(cell) = self.rates.get(name) {
            bump(&*cell);
            return;
        }
        let cell = self.rates.entry(name.to_string()).or_default();
        bump(&*cell);
    }

    /// Count one failed call under `kind`
    pub fn record_error(&self, kind: &str) {
        self.error_counts
            .entry(kind.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Add one latency sample to a trend
    pub fn observe(&self, name: &str, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);

        if let Some(histogram) = self.trends.get(name) {
            histogram.lock().saturating_record(micros);
            return;
        }
        self.trends
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(new_histogram()))
            .lock()
            .saturating_record(micros);
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let rates = self
            .rates
            .iter()
            .map(|entry| {
                let passes = entry.value().passes.load(Ordering::SeqCst);
                let total = entry.value().total.load(Ordering::SeqCst);
                (entry.key().clone(), RateValue { passes, total })
            })
            .collect();

        let trends = self
            .trends
            .iter()
            .map(|entry| {
                let histogram = entry.value().lock().clone();
                (entry.key().clone(), TrendValue { histogram })
            })
            .collect();

        let errors = self
            .error_counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let finish = self.finish_time.read().unwrap_or_else(Instant::now);
        let elapsed = self
            .start_time
            .read()
            .map(|start| finish.saturating_duration_since(start))
            .unwrap_or_default();

        MetricsSnapshot {
            counters,
            rates,
            trends,
            errors,
            elapsed,
        }
    }
}

/// Accumulated rate observations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateValue {
    pub passes: u64,
    pub total: u64,
}

impl RateValue {
    /// Share of `true` observations, `None` when nothing was recorded
    pub fn rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.passes as f64 / self.total as f64)
        }
    }
}

/// Latency distribution of a trend
#[derive(Debug, Clone)]
pub struct TrendValue {
    histogram: Histogram<u64>,
}

impl TrendValue {
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Nearest-rank percentile, `percentile` in `[0, 100]`
    ///
    /// The rank is `ceil(percentile / 100 * count)` clamped to `[1, count]`.
    /// The result is the lower edge of the bucket where the cumulative count
    /// first reaches that rank, so it never exceeds the samples in it.
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        let total = self.histogram.len();
        if total == 0 {
            return None;
        }

        let rank = (percentile.clamp(0.0, 100.0) * total as f64 / 100.0).ceil() as u64;
        let rank = rank.clamp(1, total);

        let mut seen = 0u64;
        for value in self.histogram.iter_recorded() {
            seen += value.count_at_value();
            if seen >= rank {
                return Some(self.bucket_floor(value.value_iterated_to()));
            }
        }

        self.max()
    }

    pub fn min(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| self.bucket_floor(self.histogram.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| self.bucket_floor(self.histogram.max()))
    }

    fn bucket_floor(&self, micros: u64) -> Duration {
        Duration::from_micros(self.histogram.lowest_equivalent(micros))
    }

    pub fn mean(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_secs_f64(self.histogram.mean() / 1_000_000.0))
    }

    fn summary(&self) -> TrendSummary {
        let ms = |d: Option<Duration>| d.map(as_millis_f64).unwrap_or(0.0);
        TrendSummary {
            count: self.count(),
            min_ms: ms(self.min()),
            max_ms: ms(self.max()),
            mean_ms: ms(self.mean()),
            p50_ms: ms(self.percentile(50.0)),
            p90_ms: ms(self.percentile(90.0)),
            p95_ms: ms(self.percentile(95.0)),
            p99_ms: ms(self.percentile(99.0)),
        }
    }
}

/// Duration as fractional milliseconds
pub fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Immutable view of the sink
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub rates: BTreeMap<String, RateValue>,
    pub trends: BTreeMap<String, TrendValue>,
    /// Failed calls by failure kind
    pub errors: BTreeMap<String, u64>,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn rate(&self, name: &str) -> Option<RateValue> {
        self.rates.get(name).copied()
    }

    pub fn trend(&self, name: &str) -> Option<&TrendValue> {
        self.trends.get(name)
    }

    /// Serializable digest of the snapshot
    pub fn summary(&self) -> MetricsSummary {
        let duration_secs = self.elapsed.as_secs_f64();
        let requests_per_sec = if duration_secs > 0.0 {
            self.counter(HTTP_REQS) as f64 / duration_secs
        } else {
            0.0
        };

        MetricsSummary {
            duration_secs,
            requests_per_sec,
            counters: self.counters.clone(),
            rates: self
                .rates
                .iter()
                .map(|(name, value)| {
                    let summary = RateSummary {
                        rate: value.rate().unwrap_or(0.0),
                        passes: value.passes,
                        total: value.total,
                    };
                    (name.clone(), summary)
                })
                .collect(),
            trends: self
                .trends
                .iter()
                .map(|(name, value)| (name.clone(), value.summary()))
                .collect(),
            error_counts: self.errors.clone(),
        }
    }
}

/// Metrics summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub duration_secs: f64,
    pub requests_per_sec: f64,
    pub counters: BTreeMap<String, u64>,
    pub rates: BTreeMap<String, RateSummary>,
    pub trends: BTreeMap<String, TrendSummary>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSummary {
    pub rate: f64,
    pub passes: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl MetricsSummary {
    /// Print formatted report
    pub fn print_report(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║              PAYMENT GATEWAY LOAD TEST RESULTS               ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Duration:          {:>10.2} seconds                        ║", self.duration_secs);
        println!("║ Avg RPS:           {:>10.2}                                ║", self.requests_per_sec);

        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ COUNTERS                                                     ║");
        for (name, value) in &self.counters {
            println!("║   {:20}: {:>10}                         ║", name, value);
        }

        if !self.rates.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ RATES                                                        ║");
            for (name, value) in &self.rates {
                println!(
                    "║   {:20}: {:>9.2}% ({}/{})                ║",
                    name,
                    value.rate * 100.0,
                    value.passes,
                    value.total
                );
            }
        }

        for (name, trend) in &self.trends {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ {} (milliseconds, {} samples)", name, trend.count);
            println!("║   p50:             {:>10.2}                                ║", trend.p50_ms);
            println!("║   p90:             {:>10.2}                                ║", trend.p90_ms);
            println!("║   p95:             {:>10.2}                                ║", trend.p95_ms);
            println!("║   p99:             {:>10.2}                                ║", trend.p99_ms);
            println!("║   max:             {:>10.2}                                ║", trend.max_ms);
            println!("║   mean:            {:>10.2}                                ║", trend.mean_ms);
        }

        if !self.error_counts.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ ERRORS                                                       ║");
            for (kind, count) in &self.error_counts {
                println!("║   {:20}: {:>10}                         ║", kind, count);
            }
        }

        println!("╚══════════════════════════════════════════════════════════════╝\n");
    }
}
