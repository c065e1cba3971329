//! Health evaluation
//!
//! Compares per-host [`MetricSample`]s against [`ThresholdRule`]s. Evaluation
//! is stateless: a (host, metric) pair with no [`AlertCondition`] in the
//! result is healthy right now, and callers treat that as a clear.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::metrics::HostSample;
use crate::{Error, Result};

/// Default CPU and memory alert limit, in percent
pub const DEFAULT_THRESHOLD: f64 = 80.0;

/// Metrics a rule can watch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
    ServiceActive,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
            Metric::ServiceActive => "service_active",
        }
    }

    fn is_percentage(&self) -> bool {
        matches!(self, Metric::Cpu | Metric::Memory)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Metric::Cpu),
            "memory" | "mem" => Ok(Metric::Memory),
            "service_active" | "service" => Ok(Metric::ServiceActive),
            other => Err(Error::InvalidThreshold(format!("unknown metric {:?}", other))),
        }
    }
}

/// Comparison operator of a rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Comparison {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Ge => ">=",
            Comparison::Gt => ">",
            Comparison::Le => "<=",
            Comparison::Lt => "<",
            Comparison::Eq => "==",
        }
    }

    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparison::Ge => observed >= limit,
            Comparison::Gt => observed > limit,
            Comparison::Le => observed <= limit,
            Comparison::Lt => observed < limit,
            Comparison::Eq => observed == limit,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A metric crosses the rule when `observed <comparison> limit` holds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    pub metric: Metric,
    pub comparison: Comparison,
    pub limit: f64,
}

impl ThresholdRule {
    pub fn new(metric: Metric, comparison: Comparison, limit: f64) -> Result<Self> {
        if !limit.is_finite() {
            return Err(Error::InvalidThreshold(format!(
                "{} limit must be a finite number",
                metric
            )));
        }
        if metric.is_percentage() && limit < 0.0 {
            return Err(Error::InvalidThreshold(format!(
                "{} limit must not be negative, got {}",
                metric, limit
            )));
        }
        // %mem is bounded; %cpu is not on multi-core hosts
        if metric == Metric::Memory && limit > 100.0 {
            return Err(Error::InvalidThreshold(format!(
                "memory limit must be at most 100, got {}",
                limit
            )));
        }
        Ok(Self {
            metric,
            comparison,
            limit,
        })
    }

    /// Alert when CPU usage is at or above `limit`
    pub fn cpu(limit: f64) -> Result<Self> {
        Self::new(Metric::Cpu, Comparison::Ge, limit)
    }

    /// Alert when memory usage is at or above `limit`
    pub fn memory(limit: f64) -> Result<Self> {
        Self::new(Metric::Memory, Comparison::Ge, limit)
    }

    /// Alert when the service is not active
    pub fn service_down() -> Self {
        Self {
            metric: Metric::ServiceActive,
            comparison: Comparison::Lt,
            limit: 1.0,
        }
    }

    pub fn is_crossed(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.limit)
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.comparison, self.limit)
    }
}

impl FromStr for ThresholdRule {
    type Err = Error;

    /// Parse rules such as `cpu>=80` or `memory > 90.5`
    fn from_str(s: &str) -> Result<Self> {
        static RULE: OnceLock<Regex> = OnceLock::new();
        let re = RULE.get_or_init(|| {
            Regex::new(r"^\s*([A-Za-z_]+)\s*(>=|<=|==|>|<)\s*([-+]?\d+(?:\.\d+)?)\s*$")
                .expect("static regex")
        });

        let caps = re
            .captures(s)
            .ok_or_else(|| Error::InvalidThreshold(format!("malformed rule {:?}", s)))?;

        let metric: Metric = caps[1].parse()?;
        let comparison = match &caps[2] {
            ">=" => Comparison::Ge,
            ">" => Comparison::Gt,
            "<=" => Comparison::Le,
            "<" => Comparison::Lt,
            _ => Comparison::Eq,
        };
        let limit: f64 = caps[3]
            .parse()
            .map_err(|_| Error::InvalidThreshold(format!("bad limit in {:?}", s)))?;

        Self::new(metric, comparison, limit)
    }
}

/// A (host, metric) pair currently crossing its rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertCondition {
    pub host: String,
    pub metric: Metric,
    pub observed: f64,
    pub limit: f64,
    pub comparison: Comparison,
    pub first_detected: DateTime<Utc>,
}

impl AlertCondition {
    pub fn summary(&self) -> String {
        format!(
            "{} {} is {:.1} ({} {})",
            self.host, self.metric, self.observed, self.comparison, self.limit
        )
    }
}

/// Health of one host after evaluation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Alerting,
    /// No sample could be taken
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Alerting => "alerting",
            HealthState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostHealth {
    pub host: String,
    pub state: HealthState,
    /// Sampling failure detail for `Unknown` hosts
    pub reason: Option<String>,
}

/// Result of one evaluation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub alerts: Vec<AlertCondition>,
    /// One entry per sample, in sample order
    pub hosts: Vec<HostHealth>,
}

impl Evaluation {
    pub fn count(&self, state: HealthState) -> usize {
        self.hosts.iter().filter(|h| h.state == state).count()
    }
}

/// Evaluate samples against rules.
///
/// At most one alert is produced per (host, metric); with several rules on
/// the same metric the first crossing rule wins. Hosts without a sample are
/// `Unknown` and never alert.
pub fn evaluate(samples: &[HostSample], rules: &[ThresholdRule]) -> Evaluation {
    let mut evaluation = Evaluation::default();

    for host_sample in samples {
        let host = host_sample.host.id().to_string();

        let Some(sample) = &host_sample.sample else {
            evaluation.hosts.push(HostHealth {
                host,
                state: HealthState::Unknown,
                reason: host_sample.error.clone(),
            });
            continue;
        };

        let mut seen = HashSet::new();
        for rule in rules {
            if seen.contains(&rule.metric) {
                continue;
            }
            let observed = sample.value(rule.metric);
            if rule.is_crossed(observed) {
                seen.insert(rule.metric);
                evaluation.alerts.push(AlertCondition {
                    host: host.clone(),
                    metric: rule.metric,
                    observed,
                    limit: rule.limit,
                    comparison: rule.comparison,
                    first_detected: sample.sampled_at,
                });
            }
        }

        let state = if seen.is_empty() {
            HealthState::Healthy
        } else {
            HealthState::Alerting
        };
        evaluation.hosts.push(HostHealth {
            host,
            state,
            reason: None,
        });
    }

    evaluation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSample;
    use crate::operation::ServiceState;
    use crate::Host;

    fn sampled(address: &str, cpu: f64, memory: f64, active: bool) -> HostSample {
        HostSample {
            host: Host::remote(address, "ubuntu"),
            sample: Some(MetricSample {
                cpu_percent: cpu,
                memory_percent: memory,
                service_active: active,
                service_state: if active {
                    ServiceState::Active
                } else {
                    ServiceState::Inactive
                },
                sampled_at: Utc::now(),
            }),
            error: None,
        }
    }

    #[test]
    fn test_cpu_at_85_crosses_80() {
        let rules = [ThresholdRule::cpu(80.0).unwrap()];

        let eval = evaluate(&[sampled("10.0.0.1", 85.0, 10.0, true)], &rules);
        assert_eq!(eval.alerts.len(), 1);
        assert_eq!(eval.alerts[0].metric, Metric::Cpu);
        assert_eq!(eval.alerts[0].observed, 85.0);
        assert_eq!(eval.alerts[0].limit, 80.0);
        assert_eq!(eval.hosts[0].state, HealthState::Alerting);

        let eval = evaluate(&[sampled("10.0.0.1", 79.0, 10.0, true)], &rules);
        assert!(eval.alerts.is_empty());
        assert_eq!(eval.hosts[0].state, HealthState::Healthy);
    }

    #[test]
    fn test_limit_itself_crosses() {
        let rules = [ThresholdRule::memory(80.0).unwrap()];
        let eval = evaluate(&[sampled("10.0.0.1", 0.0, 80.0, true)], &rules);
        assert_eq!(eval.alerts.len(), 1);
    }

    #[test]
    fn test_unknown_host_never_alerts() {
        let unknown = HostSample {
            host: Host::remote("10.0.0.9", "ubuntu"),
            sample: None,
            error: Some("connection refused".to_string()),
        };
        let rules = [
            ThresholdRule::cpu(0.0).unwrap(),
            ThresholdRule::service_down(),
        ];

        let eval = evaluate(&[unknown], &rules);
        assert!(eval.alerts.is_empty());
        assert_eq!(eval.hosts[0].state, HealthState::Unknown);
        assert_eq!(eval.hosts[0].reason.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_one_alert_per_host_metric() {
        let rules = [
            ThresholdRule::cpu(80.0).unwrap(),
            ThresholdRule::cpu(90.0).unwrap(),
            ThresholdRule::memory(50.0).unwrap(),
            ThresholdRule::service_down(),
        ];
        let samples = [
            sampled("10.0.0.1", 95.0, 60.0, false),
            sampled("10.0.0.2", 10.0, 10.0, true),
        ];

        let eval = evaluate(&samples, &rules);
        let metrics: Vec<_> = eval.alerts.iter().map(|a| (a.host.as_str(), a.metric)).collect();
        assert_eq!(
            metrics,
            vec![
                ("10.0.0.1", Metric::Cpu),
                ("10.0.0.1", Metric::Memory),
                ("10.0.0.1", Metric::ServiceActive),
            ]
        );
        assert_eq!(eval.alerts[0].limit, 80.0);
        assert_eq!(eval.count(HealthState::Alerting), 1);
        assert_eq!(eval.count(HealthState::Healthy), 1);
    }

    #[test]
    fn test_rule_validation() {
        assert!(ThresholdRule::cpu(f64::NAN).is_err());
        assert!(ThresholdRule::cpu(-1.0).is_err());
        assert!(ThresholdRule::memory(101.0).is_err());
        // multi-core CPU can exceed 100%
        assert!(ThresholdRule::cpu(150.0).is_ok());
    }

    #[test]
    fn test_parse_rule() {
        let rule: ThresholdRule = "cpu>=80".parse().unwrap();
        assert_eq!(rule, ThresholdRule::cpu(80.0).unwrap());

        let rule: ThresholdRule = " memory > 90.5 ".parse().unwrap();
        assert_eq!(rule.comparison, Comparison::Gt);
        assert_eq!(rule.limit, 90.5);

        assert!("disk>=80".parse::<ThresholdRule>().is_err());
        assert!("cpu=>80".parse::<ThresholdRule>().is_err());
        assert!("cpu>=".parse::<ThresholdRule>().is_err());
    }
}
