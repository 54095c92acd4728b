//! Pass/fail thresholds over the final metrics
//!
//! Expressions follow the k6 grammar `<aggregation> <operator> <number>`:
//!
//! | Aggregation               | Metric kind | Unit         |
//! |---------------------------|-------------|--------------|
//! | `p(N)` `avg` `min` `max` `med` | trend  | milliseconds |
//! | `rate`                    | rate        | 0.0 to 1.0   |
//! | `count`                   | counter     | observations |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::metrics::{as_millis_f64, MetricKind, MetricsSink, MetricsSnapshot};

/// How a metric is reduced to one number
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Rate,
    Count,
}

impl Aggregation {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "med" => Some(Self::Med),
            "rate" => Some(Self::Rate),
            "count" => Some(Self::Count),
            _ => {
                let inner = token.strip_prefix("p(")?.strip_suffix(')')?;
                let percentile: f64 = inner.trim().parse().ok()?;
                (0.0..=100.0)
                    .contains(&percentile)
                    .then_some(Self::Percentile(percentile))
            }
        }
    }

    /// Metric kind this aggregation reads
    pub fn metric_kind(&self) -> MetricKind {
        match self {
            Self::Percentile(_) | Self::Avg | Self::Min | Self::Max | Self::Med => MetricKind::Trend,
            Self::Rate => MetricKind::Rate,
            Self::Count => MetricKind::Counter,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentile(p) => write!(f, "p({})", p),
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Med => write!(f, "med"),
            Self::Rate => write!(f, "rate"),
            Self::Count => write!(f, "count"),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// At equal positions the longer token wins, so `<=` is not read as `<`
    const TOKENS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Lt => observed < limit,
            Self::Le => observed <= limit,
            Self::Gt => observed > limit,
            Self::Ge => observed >= limit,
            Self::Eq => observed == limit,
            Self::Ne => observed != limit,
        }
    }
}

/// One parsed threshold on one metric
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub limit: f64,
}

impl ThresholdSpec {
    /// Parse `expression` as a condition on `metric`
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let (position, token, comparison) = Comparison::TOKENS
            .iter()
            .filter_map(|(token, op)| expression.find(token).map(|pos| (pos, *token, *op)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
            .ok_or_else(|| invalid("missing comparison operator"))?;

        let lhs = expression[..position].trim();
        let rhs = expression[position + token.len()..].trim();

        let aggregation = Aggregation::parse(lhs)
            .ok_or_else(|| invalid(&format!("unknown aggregation '{}'", lhs)))?;
        let limit: f64 = rhs
            .parse()
            .map_err(|_| invalid(&format!("'{}' is not a number", rhs)))?;
        if !limit.is_finite() {
            return Err(invalid("limit must be finite"));
        }

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            aggregation,
            comparison,
            limit,
        })
    }

    /// Check the metric exists in `sink` and has a kind the aggregation reads
    pub fn validate(&self, sink: &MetricsSink) -> Result<(), ConfigError> {
        let kind = sink
            .kind_of(&self.metric)
            .ok_or_else(|| ConfigError::UnknownMetric(self.metric.clone()))?;

        if kind != self.aggregation.metric_kind() {
            return Err(ConfigError::IncompatibleThreshold {
                metric: self.metric.clone(),
                aggregation: self.aggregation.to_string(),
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    /// Aggregated value, `None` when the metric has no observations
    fn observe(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        match self.aggregation {
            Aggregation::Count => Some(snapshot.counter(&self.metric) as f64),
            Aggregation::Rate => snapshot.rate(&self.metric)?.rate(),
            trend_agg => {
                let trend = snapshot.trend(&self.metric)?;
                let value = match trend_agg {
                    Aggregation::Percentile(p) => trend.percentile(p),
                    Aggregation::Med => trend.percentile(50.0),
                    Aggregation::Avg => trend.mean(),
                    Aggregation::Min => trend.min(),
                    Aggregation::Max => trend.max(),
                    Aggregation::Rate | Aggregation::Count => None,
                };
                value.map(as_millis_f64)
            }
        }
    }
}

/// Outcome of one threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// Aggregated value, absent when the metric was never observed
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Overall pass/fail decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub pass: bool,
    pub failures: Vec<ThresholdResult>,
    pub evaluated: Vec<ThresholdResult>,
}

impl Verdict {
    /// Process exit status for this verdict
    pub fn exit_code(&self) -> i32 {
        if self.pass {
            0
        } else {
            1
        }
    }
}

/// Evaluates thresholds against a snapshot
pub struct ThresholdEvaluator;

impl ThresholdEvaluator {
    pub fn evaluate(snapshot: &MetricsSnapshot, specs: &[ThresholdSpec]) -> Verdict {
        let evaluated: Vec<ThresholdResult> = specs
            .iter()
            .map(|spec| {
                let observed = spec.observe(snapshot);
                // No observations: nothing to hold against the limit
                let passed = observed.map_or(true, |value| spec.comparison.holds(value, spec.limit));
                ThresholdResult {
                    metric: spec.metric.clone(),
                    expression: spec.expression.clone(),
                    observed,
                    passed,
                }
            })
            .collect();

        let failures: Vec<ThresholdResult> = evaluated.iter().filter(|r| !r.passed).cloned().collect();

        Verdict {
            pass: failures.is_empty(),
            failures,
            evaluated,
        }
    }
}
