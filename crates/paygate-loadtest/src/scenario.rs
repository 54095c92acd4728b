//! Request scenarios against the payment gateway API
//!
//! A scenario turns one virtual-user turn into the HTTP call(s) to issue. The
//! dispatcher sends them and scores the outcome.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::metrics::{PAYMENT_REQUESTS, QUERY_REQUESTS};
use crate::random::RandomSource;
use crate::transport::HttpRequest;

pub const HEALTH: &str = "health";
pub const CHANNELS: &str = "channels";
pub const PAY: &str = "pay";
pub const QUERY: &str = "query";

/// Every built-in scenario name, in dispatch table order
pub const BUILTIN_SCENARIOS: [&str; 4] = [HEALTH, CHANNELS, PAY, QUERY];

/// Length of the random part of generated order numbers
pub const ORDER_RANDOM_LEN: usize = 9;

/// One named unit of request behavior
pub trait Scenario: Send + Sync {
    /// Scenario name
    fn name(&self) -> &str;

    /// Counter incremented once per execution, if any
    fn counter(&self) -> Option<&str> {
        None
    }

    /// HTTP calls for one execution, in order
    fn plan(&self, rng: &mut dyn RandomSource) -> Vec<HttpRequest>;
}

/// Request payload defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Channels the pay scenario picks from
    pub channels: Vec<String>,
    pub total_amount: f64,
    pub subject: String,
    pub scene: String,
    pub notify_url: String,
    /// Channel sent by the query scenario
    pub query_channel: String,
    /// Order number sent by the query scenario
    pub query_order_no: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            channels: vec!["wechat".into(), "alipay".into(), "unionpay".into()],
            total_amount: 0.01,
            subject: "Stress Test Payment".to_string(),
            scene: "app".to_string(),
            notify_url: "https://example.com/notify".to_string(),
            query_channel: "wechat".to_string(),
            query_order_no: "TEST_ORDER_12345".to_string(),
        }
    }
}

// ============================================================================
// ORDER NUMBERS
// ============================================================================

/// Generates `{prefix}_{millis}_{random}` order numbers
///
/// The millisecond component never goes backwards for a given generator even
/// if the wall clock does. Uniqueness is probabilistic: two calls in the same
/// millisecond collide only if their 9 base-36 characters match.
#[derive(Debug, Default)]
pub struct OrderNumberGenerator {
    last_millis: AtomicU64,
}

impl OrderNumberGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str, rng: &mut dyn RandomSource) -> String {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let previous = self.last_millis.fetch_max(now, Ordering::Relaxed);
        let millis = previous.max(now);

        format!("{}_{}_{}", prefix, millis, rng.alphanumeric(ORDER_RANDOM_LEN))
    }
}

// ============================================================================
// BUILT-IN SCENARIOS
// ============================================================================

/// Health check scenario
pub struct HealthScenario;

impl Scenario for HealthScenario {
    fn name(&self) -> &str {
        HEALTH
    }

    fn plan(&self, _rng: &mut dyn RandomSource) -> Vec<HttpRequest> {
        vec![HttpRequest::get("/health")]
    }
}

/// Channel listing scenario
pub struct ChannelsScenario;

impl Scenario for ChannelsScenario {
    fn name(&self) -> &str {
        CHANNELS
    }

    fn plan(&self, _rng: &mut dyn RandomSource) -> Vec<HttpRequest> {
        vec![HttpRequest::get("/channels")]
    }
}

/// `POST /pay` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayRequest {
    pub channel: String,
    pub out_trade_no: String,
    pub total_amount: f64,
    pub subject: String,
    pub scene: String,
    pub notify_url: String,
}

/// Payment submission with a fresh order number per execution
pub struct PayScenario {
    payload: PayloadConfig,
    order_numbers: OrderNumberGenerator,
}

impl PayScenario {
    /// Fails without channels to pick from or with a non-positive amount
    pub fn new(payload: PayloadConfig) -> Result<Self, ConfigError> {
        if payload.channels.is_empty() {
            return Err(ConfigError::NoPaymentChannels);
        }
        if !(payload.total_amount.is_finite() && payload.total_amount > 0.0) {
            return Err(ConfigError::InvalidAmount(payload.total_amount));
        }

        Ok(Self {
            payload,
            order_numbers: OrderNumberGenerator::new(),
        })
    }

    /// Build the request body for `channel`
    pub fn request_for(&self, channel: &str, rng: &mut dyn RandomSource) -> PayRequest {
        let prefix = format!("TEST_{}", channel.to_uppercase());
        PayRequest {
            channel: channel.to_string(),
            out_trade_no: self.order_numbers.next(&prefix, rng),
            total_amount: self.payload.total_amount,
            subject: self.payload.subject.clone(),
            scene: self.payload.scene.clone(),
            notify_url: self.payload.notify_url.clone(),
        }
    }
}

impl Scenario for PayScenario {
    fn name(&self) -> &str {
        PAY
    }

    fn counter(&self) -> Option<&str> {
        Some(PAYMENT_REQUESTS)
    }

    fn plan(&self, rng: &mut dyn RandomSource) -> Vec<HttpRequest> {
        let channel = &self.payload.channels[rng.next_index(self.payload.channels.len())];
        let body = self.request_for(channel, rng);
        vec![HttpRequest::post_json("/pay", &body)]
    }
}

/// `POST /query` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub channel: String,
    pub out_trade_no: String,
}

/// Order status query
pub struct QueryScenario {
    request: QueryRequest,
}

impl QueryScenario {
    pub fn new(payload: &PayloadConfig) -> Self {
        Self {
            request: QueryRequest {
                channel: payload.query_channel.clone(),
                out_trade_no: payload.query_order_no.clone(),
            },
        }
    }
}

impl Scenario for QueryScenario {
    fn name(&self) -> &str {
        QUERY
    }

    fn counter(&self) -> Option<&str> {
        Some(QUERY_REQUESTS)
    }

    fn plan(&self, _rng: &mut dyn RandomSource) -> Vec<HttpRequest> {
        vec![HttpRequest::post_json("/query", &self.request)]
    }
}

/// Built-in scenario by name
pub fn builtin(name: &str, payload: &PayloadConfig) -> Result<Arc<dyn Scenario>, ConfigError> {
    let scenario: Arc<dyn Scenario> = match name {
        HEALTH => Arc::new(HealthScenario),
        CHANNELS => Arc::new(ChannelsScenario),
        PAY => Arc::new(PayScenario::new(payload.clone())?),
        QUERY => Arc::new(QueryScenario::new(payload)),
        _ => return Err(ConfigError::UnknownScenario(name.to_string())),
    };
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{SequenceRandom, StdRandom};
    use reqwest::Method;
    use std::collections::HashSet;

    #[test]
    fn test_order_number_format() {
        let generator = OrderNumberGenerator::new();
        let mut rng = StdRandom::seeded(1);
        let order = generator.next("TEST_WECHAT", &mut rng);

        let parts: Vec<&str> = order.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "TEST");
        assert_eq!(parts[1], "WECHAT");
        assert!(parts[2].parse::<u64>().is_ok());
        assert_eq!(parts[3].len(), ORDER_RANDOM_LEN);
        assert!(parts[3].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_order_timestamps_non_decreasing() {
        let generator = OrderNumberGenerator::new();
        let mut rng = StdRandom::seeded(2);
        let mut last = 0u64;
        for _ in 0..500 {
            let order = generator.next("P", &mut rng);
            let millis: u64 = order.split('_').nth(1).unwrap().parse().unwrap();
            assert!(millis >= last);
            last = millis;
        }
    }

    #[test]
    fn test_order_numbers_unique_across_users() {
        let scenario = Arc::new(PayScenario::new(PayloadConfig::default()).unwrap());
        let handles: Vec<_> = (0..2u64)
            .map(|user| {
                let scenario = scenario.clone();
                std::thread::spawn(move || {
                    let mut rng = StdRandom::seeded(1000 + user);
                    (0..1000)
                        .map(|_| scenario.request_for("wechat", &mut rng).out_trade_no)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate order number");
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_pay_plan() {
        let scenario = PayScenario::new(PayloadConfig::default()).unwrap();
        // 0.5 picks "alipay" out of three channels
        let mut rng = SequenceRandom::new(vec![0.5]);
        let plan = scenario.plan(&mut rng);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].method, Method::POST);
        assert_eq!(plan[0].path, "/pay");

        let body: PayRequest = serde_json::from_value(plan[0].body.clone().unwrap()).unwrap();
        assert_eq!(body.channel, "alipay");
        assert!(body.out_trade_no.starts_with("TEST_ALIPAY_"));
        assert_eq!(body.total_amount, 0.01);
        assert_eq!(body.scene, "app");
        assert_eq!(scenario.counter(), Some(PAYMENT_REQUESTS));
    }

    #[test]
    fn test_pay_rejects_unusable_payload() {
        let mut payload = PayloadConfig::default();
        payload.channels.clear();
        assert!(matches!(
            PayScenario::new(payload.clone()),
            Err(ConfigError::NoPaymentChannels)
        ));
        assert!(matches!(builtin(PAY, &payload), Err(ConfigError::NoPaymentChannels)));
        // Scenarios that ignore channels still build
        assert!(builtin(HEALTH, &payload).is_ok());

        for amount in [f64::NAN, f64::INFINITY, 0.0, -1.0] {
            let payload = PayloadConfig {
                total_amount: amount,
                ..Default::default()
            };
            assert!(
                matches!(PayScenario::new(payload), Err(ConfigError::InvalidAmount(_))),
                "accepted amount {}",
                amount
            );
        }
    }

    #[test]
    fn test_query_plan() {
        let scenario = QueryScenario::new(&PayloadConfig::default());
        let mut rng = SequenceRandom::new(vec![0.0]);
        let plan = scenario.plan(&mut rng);

        assert_eq!(plan[0].path, "/query");
        let body = plan[0].body.as_ref().unwrap();
        assert_eq!(body["channel"], "wechat");
        assert_eq!(body["out_trade_no"], "TEST_ORDER_12345");
        assert_eq!(scenario.counter(), Some(QUERY_REQUESTS));
    }

    #[test]
    fn test_builtin_lookup() {
        let payload = PayloadConfig::default();
        for name in BUILTIN_SCENARIOS {
            let scenario = builtin(name, &payload).unwrap();
            assert_eq!(scenario.name(), name);
        }
        assert!(matches!(
            builtin("refund", &payload),
            Err(ConfigError::UnknownScenario(name)) if name == "refund"
        ));
        assert_eq!(builtin(HEALTH, &payload).unwrap().counter(), None);
        assert_eq!(builtin(CHANNELS, &payload).unwrap().counter(), None);
    }
}
