//! Terminal and JSON output

use fleetctl_core::{
    AlertSummary, Evaluation, FleetResult, HealthState, HostSample, OutcomeStatus, Verdict,
};
use serde::Serialize;

/// Process exit code for a dispatch verdict
pub fn exit_code(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::AllSucceeded => 0,
        Verdict::PartialFailure => 2,
        Verdict::AllFailed => 3,
    }
}

fn status_mark(status: OutcomeStatus) -> &'static str {
    match status {
        OutcomeStatus::Success => "✓",
        OutcomeStatus::Cancelled => "-",
        _ => "✗",
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Per-host outcome listing with the failures spelled out
pub fn print_fleet_result(title: &str, result: &FleetResult, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(result);
    }

    println!("{}", title);
    for entry in result.entries() {
        let outcome = &entry.outcome;
        let mut line = format!(
            "  {} [{}] {:<32} {:<16} {:>6}ms",
            status_mark(outcome.status),
            entry.host.index,
            entry.host.display(),
            outcome.status,
            outcome.elapsed_ms
        );
        if outcome.retries > 0 {
            line.push_str(&format!(" (retries: {})", outcome.retries));
        }
        println!("{}", line);

        if outcome.is_success() {
            let stdout = outcome.stdout.trim();
            if !stdout.is_empty() {
                for l in stdout.lines().take(5) {
                    println!("      {}", l);
                }
            }
        } else {
            println!("      {}", outcome.reason());
        }
    }

    println!(
        "{}: {}/{} hosts succeeded{}",
        result.verdict(),
        result.success_count(),
        result.len(),
        if result.was_cancelled() { " (cancelled)" } else { "" }
    );
    Ok(())
}

#[derive(Serialize)]
struct DashboardJson<'a> {
    service: &'a str,
    verdict: Verdict,
    samples: &'a [HostSample],
}

/// Host / service / status / CPU / memory / checked-at table
pub fn print_dashboard(
    service: &str,
    result: &FleetResult,
    samples: &[HostSample],
    json: bool,
) -> anyhow::Result<()> {
    if json {
        return print_json(&DashboardJson {
            service,
            verdict: result.verdict(),
            samples,
        });
    }

    println!("Service Metrics Dashboard");
    println!(
        "{:<24} {:<16} {:<14} {:>7} {:>10}  {}",
        "HOST", "SERVICE", "STATUS", "CPU(%)", "MEMORY(%)", "CHECKED AT"
    );
    for host_sample in samples {
        let host = host_sample.host.name.as_deref().unwrap_or(&host_sample.host.address);
        match &host_sample.sample {
            Some(sample) => println!(
                "{:<24} {:<16} {:<14} {:>7.1} {:>10.1}  {}",
                host,
                service,
                sample.service_state.to_string(),
                sample.cpu_percent,
                sample.memory_percent,
                sample.sampled_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!(
                "{:<24} {:<16} {:<14} {:>7} {:>10}  {}",
                host,
                service,
                "unreachable",
                "-",
                "-",
                host_sample.error.as_deref().unwrap_or("no sample")
            ),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct HealthJson<'a> {
    service: &'a str,
    verdict: Verdict,
    evaluation: &'a Evaluation,
    notifications: AlertSummary,
}

pub fn print_health(
    service: &str,
    result: &FleetResult,
    evaluation: &Evaluation,
    summary: AlertSummary,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        return print_json(&HealthJson {
            service,
            verdict: result.verdict(),
            evaluation,
            notifications: summary,
        });
    }

    println!("Health of {}", service);
    for host in &evaluation.hosts {
        let mark = match host.state {
            HealthState::Healthy => "✓",
            HealthState::Alerting => "!",
            HealthState::Unknown => "?",
        };
        match &host.reason {
            Some(reason) => println!("  {} {:<24} {} ({})", mark, host.host, host.state, reason),
            None => println!("  {} {:<24} {}", mark, host.host, host.state),
        }
        for alert in evaluation.alerts.iter().filter(|a| a.host == host.host) {
            println!(
                "      {} {:.1} {} {}",
                alert.metric, alert.observed, alert.comparison, alert.limit
            );
        }
    }

    println!(
        "{} healthy, {} alerting, {} unknown; notifications: {} sent, {} suppressed, {} failed",
        evaluation.count(HealthState::Healthy),
        evaluation.count(HealthState::Alerting),
        evaluation.count(HealthState::Unknown),
        summary.sent,
        summary.suppressed,
        summary.failed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(exit_code(Verdict::AllSucceeded), 0);
        assert_eq!(exit_code(Verdict::PartialFailure), 2);
        assert_eq!(exit_code(Verdict::AllFailed), 3);
    }
}
