//! Service metric sampling
//!
//! One shell script per host reports the unit state and the summed CPU and
//! memory share of the service's processes as `key=value` lines. Sampling goes
//! through the [`FleetDispatcher`], so it gets the same retry, timeout and
//! ordering guarantees as any other operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::dispatch::{DispatchMode, FleetDispatcher};
use crate::health::Metric;
use crate::operation::{shell_quote, validate_service_name, Operation, ServiceState, DEFAULT_TIMEOUT};
use crate::{FleetResult, Host, Result};

/// Point-in-time reading for one host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub service_active: bool,
    pub service_state: ServiceState,
    pub sampled_at: DateTime<Utc>,
}

impl MetricSample {
    /// Parse the `state=`, `cpu=` and `mem=` lines printed by the sampling
    /// script. Missing or malformed numbers read as 0.0.
    pub fn parse(stdout: &str, sampled_at: DateTime<Utc>) -> Self {
        let mut state = None;
        let mut cpu = 0.0;
        let mut memory = 0.0;

        for line in stdout.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key {
                "state" => state = Some(ServiceState::parse(value)),
                "cpu" => cpu = parse_percent(value),
                "mem" => memory = parse_percent(value),
                _ => {}
            }
        }

        let service_state = state.unwrap_or_else(|| ServiceState::Unknown("unknown".to_string()));
        Self {
            cpu_percent: cpu,
            memory_percent: memory,
            service_active: service_state.is_active(),
            service_state,
            sampled_at,
        }
    }

    /// Observed value for a metric; service state reads as 1.0 / 0.0
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cpu => self.cpu_percent,
            Metric::Memory => self.memory_percent,
            Metric::ServiceActive => {
                if self.service_active {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

fn parse_percent(value: &str) -> f64 {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

/// A host and its sample, if one could be taken
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSample {
    pub host: Host,
    pub sample: Option<MetricSample>,
    /// Why no sample was taken
    pub error: Option<String>,
}

/// Operation that samples `service` on a host
pub fn metrics_operation(service: &str) -> Result<Operation> {
    validate_service_name(service)?;

    let unit = shell_quote(service);
    let process = shell_quote(service.trim_end_matches(".service"));
    let script = format!(
        concat!(
            "state=$(systemctl is-active {unit} 2>/dev/null); ",
            "echo \"state=${{state:-unknown}}\"; ",
            "pids=$(systemctl show {unit} --property=MainPID --value 2>/dev/null); ",
            "if [ -z \"$pids\" ] || [ \"$pids\" = 0 ]; then ",
            "pids=$(pgrep -x {process} 2>/dev/null | head -n 5 | paste -sd, -); ",
            "fi; ",
            "if [ -n \"$pids\" ]; then ",
            "ps -p \"$pids\" -o %cpu=,%mem= 2>/dev/null ",
            "| awk '{{c+=$1; m+=$2}} END {{printf \"cpu=%.1f\\nmem=%.1f\\n\", c, m}}'; ",
            "fi; ",
            "exit 0"
        ),
        unit = unit,
        process = process
    );

    Ok(Operation::command(format!("metrics {}", service), script))
}

/// Turn a sampling dispatch into per-host samples, in dispatch order.
/// Each sample is stamped with the time its host finished.
pub fn samples_from(result: &FleetResult) -> Vec<HostSample> {
    result
        .entries()
        .iter()
        .map(|entry| {
            if entry.outcome.is_success() {
                HostSample {
                    host: entry.host.clone(),
                    sample: Some(MetricSample::parse(
                        &entry.outcome.stdout,
                        entry.outcome.finished_at,
                    )),
                    error: None,
                }
            } else {
                HostSample {
                    host: entry.host.clone(),
                    sample: None,
                    error: Some(entry.outcome.reason()),
                }
            }
        })
        .collect()
}

/// Samples service metrics across a fleet
#[derive(Clone)]
pub struct MetricsSampler {
    dispatcher: FleetDispatcher,
    timeout: Duration,
}

impl MetricsSampler {
    pub fn new(dispatcher: FleetDispatcher) -> Self {
        Self {
            dispatcher,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-attempt timeout of the sampling command
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip(self, hosts, cancel), fields(hosts = hosts.len()))]
    pub async fn sample(
        &self,
        hosts: &[Host],
        service: &str,
        mode: DispatchMode,
        cancel: &CancellationToken,
    ) -> Result<(FleetResult, Vec<HostSample>)> {
        let operation = metrics_operation(service)?.with_timeout(self.timeout);
        let result = self
            .dispatcher
            .dispatch_with_cancel(hosts, &operation, mode, cancel)
            .await?;

        let samples = samples_from(&result);
        for sample in &samples {
            match (&sample.sample, &sample.error) {
                (Some(s), _) => debug!(
                    host = %sample.host.id(),
                    state = %s.service_state,
                    cpu = s.cpu_percent,
                    memory = s.memory_percent,
                    "Sampled metrics"
                ),
                (None, error) => warn!(
                    host = %sample.host.id(),
                    error = ?error,
                    "Metrics unavailable"
                ),
            }
        }

        Ok((result, samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteExecutor, RetryPolicy};
    use crate::testing::{ScriptedTransport, Step};
    use crate::transport::{CommandOutput, TransportError};
    use crate::operation::Action;
    use std::sync::Arc;

    #[test]
    fn test_parse_sample() {
        let now = Utc::now();
        let sample = MetricSample::parse("state=active\ncpu=12.5\nmem=3.0\n", now);
        assert_eq!(sample.service_state, ServiceState::Active);
        assert!(sample.service_active);
        assert_eq!(sample.cpu_percent, 12.5);
        assert_eq!(sample.memory_percent, 3.0);
        assert_eq!(sample.sampled_at, now);
        assert_eq!(sample.value(Metric::ServiceActive), 1.0);
    }

    #[test]
    fn test_parse_sample_without_process() {
        // Inactive unit: no PIDs, so no cpu/mem lines
        let sample = MetricSample::parse("state=inactive\n", Utc::now());
        assert_eq!(sample.service_state, ServiceState::Inactive);
        assert!(!sample.service_active);
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_percent, 0.0);
        assert_eq!(sample.value(Metric::ServiceActive), 0.0);
    }

    #[test]
    fn test_parse_sample_garbage() {
        let sample = MetricSample::parse("cpu=abc\nmem=-4\nnoise\n", Utc::now());
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_percent, 0.0);
        assert_eq!(sample.service_state, ServiceState::Unknown("unknown".to_string()));
    }

    #[test]
    fn test_metrics_operation_quotes_service() {
        let op = metrics_operation("nginx.service").unwrap();
        let Action::Command(script) = &op.action else {
            panic!("metrics must be a command");
        };
        assert!(script.contains("systemctl is-active 'nginx.service'"));
        assert!(script.contains("pgrep -x 'nginx'"));
        assert!(script.ends_with("exit 0"));

        assert!(metrics_operation("nginx && reboot").is_err());
    }

    #[tokio::test]
    async fn test_sampler_marks_unreachable_hosts() {
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.1", vec![Step::ok("state=active\ncpu=85.0\nmem=20.0\n")]);
        transport.script(
            "10.0.0.2",
            vec![Step::Connect(TransportError::Unreachable("no route".into()))],
        );

        let executor = RemoteExecutor::new(Arc::new(transport.clone()))
            .with_retry(RetryPolicy::immediate(2));
        let sampler = MetricsSampler::new(FleetDispatcher::new(Arc::new(executor)));
        let hosts = vec![
            Host::remote("10.0.0.1", "ubuntu"),
            Host::remote("10.0.0.2", "ubuntu").with_index(1),
        ];

        let (result, samples) = sampler
            .sample(&hosts, "nginx", DispatchMode::All, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(samples[0].sample.as_ref().unwrap().cpu_percent, 85.0);
        assert!(samples[1].sample.is_none());
        assert!(samples[1].error.as_ref().unwrap().contains("no route"));
    }

    #[tokio::test]
    async fn test_each_sample_carries_its_own_reading_time() {
        let transport = ScriptedTransport::new();
        transport.script(
            "10.0.0.1",
            vec![Step::Delay(
                Duration::from_millis(150),
                CommandOutput {
                    stdout: "state=active\ncpu=1.0\nmem=1.0\n".to_string(),
                    ..CommandOutput::default()
                },
            )],
        );
        transport.script("10.0.0.2", vec![Step::ok("state=active\ncpu=2.0\nmem=2.0\n")]);

        // One host at a time, so the second reading is taken after the first
        let dispatcher = FleetDispatcher::new(Arc::new(RemoteExecutor::new(Arc::new(transport))))
            .with_max_parallel(1);
        let sampler = MetricsSampler::new(dispatcher);
        let hosts = vec![
            Host::remote("10.0.0.1", "ubuntu"),
            Host::remote("10.0.0.2", "ubuntu").with_index(1),
        ];

        let (result, samples) = sampler
            .sample(&hosts, "nginx", DispatchMode::All, &CancellationToken::new())
            .await
            .unwrap();

        let first = samples[0].sample.as_ref().unwrap().sampled_at;
        let second = samples[1].sample.as_ref().unwrap().sampled_at;
        assert_eq!(first, result.entries()[0].outcome.finished_at);
        assert_eq!(second, result.entries()[1].outcome.finished_at);
        assert!(first <= second);
        assert!(first < Utc::now());
    }
}
