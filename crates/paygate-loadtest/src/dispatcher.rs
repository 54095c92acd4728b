//! Weighted scenario selection and execution

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ConfigError;
use crate::metrics::{MetricsSink, ERRORS, HTTP_REQS, HTTP_REQ_DURATION, ITERATIONS};
use crate::random::RandomSource;
use crate::scenario::Scenario;
use crate::transport::{RequestFailure, Transport};

/// Scenario with its selection weight
#[derive(Clone)]
pub struct WeightedScenario {
    pub scenario: Arc<dyn Scenario>,
    pub weight: u32,
}

impl WeightedScenario {
    pub fn new(scenario: Arc<dyn Scenario>, weight: u32) -> Self {
        Self { scenario, weight }
    }
}

/// Result of one scenario execution
#[derive(Debug, Clone)]
pub struct Outcome {
    pub scenario: String,
    pub success: bool,
    /// From the first request's start to the last request's completion
    pub latency: Duration,
    pub started_at: Instant,
    pub completed_at: Instant,
    /// Status of the last failing call, if it returned one
    pub status: Option<u16>,
    /// Transport failure of the last failing call, if any
    pub failure: Option<RequestFailure>,
}

/// Picks a scenario per turn and records its outcome
pub struct ScenarioDispatcher {
    entries: Vec<WeightedScenario>,
    total_weight: u64,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsSink>,
    request_timeout: Duration,
}

impl ScenarioDispatcher {
    /// Zero-weight entries are dropped; at least one must remain
    pub fn new(
        entries: Vec<WeightedScenario>,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsSink>,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let entries: Vec<_> = entries.into_iter().filter(|e| e.weight > 0).collect();
        if entries.is_empty() {
            return Err(ConfigError::EmptyScenarioSet);
        }
        if request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        let total_weight = entries.iter().map(|e| u64::from(e.weight)).sum();

        Ok(Self {
            entries,
            total_weight,
            transport,
            metrics,
            request_timeout,
        })
    }

    /// Scenarios eligible for selection
    pub fn entries(&self) -> &[WeightedScenario] {
        &self.entries
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    /// Pick a scenario with probability proportional to its weight
    pub fn select(&self, rng: &mut dyn RandomSource) -> &Arc<dyn Scenario> {
        let point = rng.next_f64() * self.total_weight as f64;
        let mut cumulative = 0.0;
        for entry in &self.entries {
            cumulative += f64::from(entry.weight);
            if point < cumulative {
                return &entry.scenario;
            }
        }
        // point can only reach total_weight through rounding
        &self.entries[self.entries.len() - 1].scenario
    }

    /// Run one scenario turn and push its outcome into the metrics sink
    pub async fn execute(&self, rng: &mut dyn RandomSource) -> Outcome {
        let scenario = self.select(rng).clone();
        let requests = scenario.plan(rng);

        let started_at = Instant::now();
        let mut success = true;
        let mut status = None;
        let mut failure = None;

        for request in &requests {
            let call_start = Instant::now();
            let result = match tokio::time::timeout(self.request_timeout, self.transport.send(request)).await {
                Ok(result) => result,
                Err(_) => Err(RequestFailure::Timeout(self.request_timeout)),
            };
            self.metrics.observe(HTTP_REQ_DURATION, call_start.elapsed());
            self.metrics.increment(HTTP_REQS);

            match result {
                Ok(200) => {}
                Ok(code) => {
                    debug!("{} {} returned {}", request.method, request.path, code);
                    self.metrics.record_error(&format!("http_{}", code));
                    success = false;
                    status = Some(code);
                }
                Err(e) => {
                    debug!("{} {} failed: {}", request.method, request.path, e);
                    self.metrics.record_error(e.kind());
                    success = false;
                    failure = Some(e);
                }
            }
        }

        let completed_at = Instant::now();

        if let Some(counter) = scenario.counter() {
            self.metrics.increment(counter);
        }
        self.metrics.record(ERRORS, !success);
        self.metrics.increment(ITERATIONS);

        Outcome {
            scenario: scenario.name().to_string(),
            success,
            latency: completed_at - started_at,
            started_at,
            completed_at,
            status,
            failure,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::{PAYMENT_REQUESTS, QUERY_REQUESTS};
    use crate::random::{SequenceRandom, StdRandom};
    use crate::scenario::{builtin, PayloadConfig, BUILTIN_SCENARIOS, HEALTH, PAY, QUERY};
    use crate::transport::HttpRequest;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// In-process target: fixed latency, per-path status overrides
    pub(crate) struct FakeTransport {
        pub latency: Duration,
        pub statuses: HashMap<String, u16>,
    }

    impl FakeTransport {
        pub fn ok(latency: Duration) -> Self {
            Self {
                latency,
                statuses: HashMap::new(),
            }
        }

        pub fn with_status(mut self, path: &str, status: u16) -> Self {
            self.statuses.insert(path.to_string(), status);
            self
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: &HttpRequest) -> Result<u16, RequestFailure> {
            tokio::time::sleep(self.latency).await;
            Ok(self.statuses.get(&request.path).copied().unwrap_or(200))
        }
    }

    pub(crate) fn builtin_entries() -> Vec<WeightedScenario> {
        let payload = PayloadConfig::default();
        BUILTIN_SCENARIOS
            .iter()
            .map(|name| builtin(name, &payload).unwrap())
            .map(|s| WeightedScenario::new(s, 1))
            .collect()
    }

    fn dispatcher(transport: FakeTransport, entries: Vec<WeightedScenario>) -> ScenarioDispatcher {
        ScenarioDispatcher::new(
            entries,
            Arc::new(transport),
            Arc::new(MetricsSink::with_defaults()),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_scenario_set_rejected() {
        let result = ScenarioDispatcher::new(
            vec![],
            Arc::new(FakeTransport::ok(Duration::ZERO)),
            Arc::new(MetricsSink::with_defaults()),
            Duration::from_secs(30),
        );
        assert!(matches!(result, Err(ConfigError::EmptyScenarioSet)));

        let zero_weights = builtin_entries()
            .into_iter()
            .map(|e| WeightedScenario::new(e.scenario, 0))
            .collect();
        let result = ScenarioDispatcher::new(
            zero_weights,
            Arc::new(FakeTransport::ok(Duration::ZERO)),
            Arc::new(MetricsSink::with_defaults()),
            Duration::from_secs(30),
        );
        assert!(matches!(result, Err(ConfigError::EmptyScenarioSet)));
    }

    #[test]
    fn test_uniform_selection() {
        let d = dispatcher(FakeTransport::ok(Duration::ZERO), builtin_entries());
        let mut rng = SequenceRandom::new(vec![0.0, 0.3, 0.6, 0.9]);
        let picked: Vec<String> = (0..4).map(|_| d.select(&mut rng).name().to_string()).collect();
        assert_eq!(picked, vec!["health", "channels", "pay", "query"]);
    }

    #[test]
    fn test_weighted_selection() {
        let payload = PayloadConfig::default();
        let entries = vec![
            WeightedScenario::new(builtin(HEALTH, &payload).unwrap(), 1),
            WeightedScenario::new(builtin(PAY, &payload).unwrap(), 3),
        ];
        let d = dispatcher(FakeTransport::ok(Duration::ZERO), entries);

        // Boundary at 1/4 of the total weight
        let mut rng = SequenceRandom::new(vec![0.24, 0.25, 0.99]);
        assert_eq!(d.select(&mut rng).name(), "health");
        assert_eq!(d.select(&mut rng).name(), "pay");
        assert_eq!(d.select(&mut rng).name(), "pay");

        let mut rng = StdRandom::seeded(9);
        let pays = (0..10_000).filter(|_| d.select(&mut rng).name() == "pay").count();
        assert!((7_000..8_000).contains(&pays), "pay picked {} times", pays);
    }

    #[test]
    fn test_zero_weight_excluded() {
        let payload = PayloadConfig::default();
        let entries = vec![
            WeightedScenario::new(builtin(HEALTH, &payload).unwrap(), 0),
            WeightedScenario::new(builtin(QUERY, &payload).unwrap(), 2),
        ];
        let d = dispatcher(FakeTransport::ok(Duration::ZERO), entries);
        assert_eq!(d.entries().len(), 1);
        let mut rng = SequenceRandom::new(vec![0.0]);
        assert_eq!(d.select(&mut rng).name(), "query");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_records_success() {
        let d = dispatcher(FakeTransport::ok(Duration::from_millis(100)), builtin_entries());
        // 0.6 selects pay
        let mut rng = SequenceRandom::new(vec![0.6]);
        let outcome = d.execute(&mut rng).await;

        assert_eq!(outcome.scenario, "pay");
        assert!(outcome.success);
        assert_eq!(outcome.latency, Duration::from_millis(100));
        assert!(outcome.completed_at >= outcome.started_at);

        let snapshot = d.metrics().snapshot();
        assert_eq!(snapshot.counter(PAYMENT_REQUESTS), 1);
        assert_eq!(snapshot.counter(QUERY_REQUESTS), 0);
        assert_eq!(snapshot.counter(HTTP_REQS), 1);
        assert_eq!(snapshot.counter(ITERATIONS), 1);
        assert_eq!(snapshot.rate(ERRORS).unwrap().passes, 0);
        assert_eq!(snapshot.rate(ERRORS).unwrap().total, 1);
        assert!(snapshot.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_records_failure_status() {
        let transport = FakeTransport::ok(Duration::from_millis(5)).with_status("/pay", 500);
        let d = dispatcher(transport, builtin_entries());
        let mut rng = SequenceRandom::new(vec![0.6]);
        let outcome = d.execute(&mut rng).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, Some(500));
        let snapshot = d.metrics().snapshot();
        assert_eq!(snapshot.counter(PAYMENT_REQUESTS), 1);
        assert_eq!(snapshot.rate(ERRORS).unwrap().passes, 1);
        assert_eq!(snapshot.errors.get("http_500"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_has_no_dedicated_counter() {
        let d = dispatcher(FakeTransport::ok(Duration::from_millis(1)), builtin_entries());
        let mut rng = SequenceRandom::new(vec![0.0]);
        let outcome = d.execute(&mut rng).await;

        assert_eq!(outcome.scenario, "health");
        let snapshot = d.metrics().snapshot();
        assert_eq!(snapshot.counter(PAYMENT_REQUESTS), 0);
        assert_eq!(snapshot.counter(QUERY_REQUESTS), 0);
        assert_eq!(snapshot.counter(ITERATIONS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_failure() {
        let d = ScenarioDispatcher::new(
            builtin_entries(),
            Arc::new(FakeTransport::ok(Duration::from_secs(60))),
            Arc::new(MetricsSink::with_defaults()),
            Duration::from_secs(30),
        )
        .unwrap();
        let mut rng = SequenceRandom::new(vec![0.9]);
        let outcome = d.execute(&mut rng).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(RequestFailure::Timeout(Duration::from_secs(30))));
        assert_eq!(outcome.latency, Duration::from_secs(30));
        let snapshot = d.metrics().snapshot();
        assert_eq!(snapshot.counter(QUERY_REQUESTS), 1);
        assert_eq!(snapshot.errors.get("timeout"), Some(&1));
    }
}
