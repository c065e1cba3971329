//! Remote execution with retry and timeout discipline
//!
//! Each call to [`RemoteExecutor`] runs one [`Operation`] against one
//! [`Host`]. Attempts are classified as success, retryable failure or
//! terminal failure; retryable failures back off exponentially until the
//! attempt budget is spent. Nothing is raised to the caller: every failure
//! ends up in the returned [`ExecutionOutcome`].

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::operation::{shell_quote, Action, Operation};
use crate::transport::{CommandOutput, Session, Transport, TransportError};
use crate::{ExecutionOutcome, Host, OutcomeStatus};

/// Runs operations against single hosts
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        host: &Host,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome;
}

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts, 500ms doubling up to 5s
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before the retry following failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Classified result of one attempt
enum Attempt {
    Success(CommandOutput),
    Retryable(TransportError),
    Terminal {
        status: OutcomeStatus,
        /// Present when a command ran to completion
        output: Option<CommandOutput>,
        error: Option<String>,
        /// The session can no longer be trusted
        discard_session: bool,
    },
}

impl Attempt {
    fn from_transport(err: TransportError) -> Self {
        if err.is_retryable() {
            Attempt::Retryable(err)
        } else {
            Attempt::Terminal {
                status: err.status(),
                output: None,
                error: Some(err.to_string()),
                discard_session: true,
            }
        }
    }
}

/// Per-call state carried across attempts
#[derive(Default)]
struct CallState {
    session: Option<Box<dyn Session>>,
    backup_done: bool,
}

impl CallState {
    async fn discard_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Remote command executor
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl RemoteExecutor {
    /// Create a new remote executor
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// One attempt: connect if needed, then run the action.
    ///
    /// The session is stored in `state` as soon as it opens so that a caller
    /// dropping this future (timeout, cancellation) still owns it and can
    /// close it.
    async fn attempt(&self, host: &Host, operation: &Operation, state: &mut CallState) -> Attempt {
        if state.session.is_none() {
            match self.transport.connect(host).await {
                Ok(session) => state.session = Some(session),
                Err(e) => return Attempt::from_transport(e),
            }
        }
        let Some(session) = state.session.as_mut() else {
            return Attempt::Retryable(TransportError::Transport("session unavailable".into()));
        };

        match &operation.action {
            Action::Command(command) => match session.exec(command).await {
                Ok(output) if operation.predicate.check(&output) => Attempt::Success(output),
                Ok(output) => Attempt::Terminal {
                    status: OutcomeStatus::Failed,
                    error: Some(failure_detail(&output)),
                    output: Some(output),
                    discard_session: false,
                },
                Err(e) => Attempt::from_transport(e),
            },
            Action::Upload {
                payload,
                remote_path,
                backup,
            } => {
                if *backup && !state.backup_done {
                    state.backup_done = true;
                    backup_remote_file(host, &mut **session, remote_path).await;
                }

                if let Some(parent) = remote_parent(remote_path) {
                    match session.exec(&format!("mkdir -p {}", shell_quote(parent))).await {
                        Ok(output) if output.exit_code == 0 => {}
                        Ok(output) => {
                            return Attempt::Terminal {
                                status: OutcomeStatus::Failed,
                                error: Some(format!("could not create {}", parent)),
                                output: Some(output),
                                discard_session: false,
                            }
                        }
                        Err(e) => return Attempt::from_transport(e),
                    }
                }

                match session.upload(payload, remote_path).await {
                    Ok(()) => Attempt::Success(CommandOutput {
                        stdout: format!("wrote {} bytes to {}", payload.len(), remote_path),
                        ..CommandOutput::default()
                    }),
                    Err(e) => Attempt::from_transport(e),
                }
            }
        }
    }

    fn outcome(
        host: &Host,
        status: OutcomeStatus,
        output: Option<CommandOutput>,
        error: Option<String>,
        started: Instant,
        retries: u32,
    ) -> ExecutionOutcome {
        let exit_code = output.as_ref().map(|o| o.exit_code);
        let output = output.unwrap_or_default();
        ExecutionOutcome {
            host: host.id().to_string(),
            status,
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed_ms: started.elapsed().as_millis() as u64,
            retries,
            error,
            finished_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    #[instrument(skip(self, host, operation, cancel), fields(host = %host.id(), operation = %operation.name))]
    async fn execute(
        &self,
        host: &Host,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut state = CallState::default();
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;
            let retries = attempt - 1;

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                step = tokio::time::timeout(operation.timeout, self.attempt(host, operation, &mut state)) => {
                    Some(step.unwrap_or(Attempt::Retryable(TransportError::Timeout)))
                }
            };

            let Some(step) = step else {
                info!(attempt, "Operation cancelled");
                break ExecutionOutcome::cancelled(host, started.elapsed(), retries);
            };

            match step {
                Attempt::Success(output) => {
                    debug!(attempt, "Operation succeeded");
                    break Self::outcome(
                        host,
                        OutcomeStatus::Success,
                        Some(output),
                        None,
                        started,
                        retries,
                    );
                }
                Attempt::Terminal {
                    status,
                    output,
                    error,
                    discard_session,
                } => {
                    warn!(attempt, status = %status, error = ?error, "Operation failed");
                    if discard_session {
                        state.discard_session().await;
                    }
                    break Self::outcome(host, status, output, error, started, retries);
                }
                Attempt::Retryable(err) => {
                    state.discard_session().await;

                    if attempt >= max_attempts {
                        warn!(attempt, error = %err, "Retry budget exhausted");
                        break Self::outcome(
                            host,
                            err.status(),
                            None,
                            Some(err.to_string()),
                            started,
                            retries,
                        );
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );

                    let cancelled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        break ExecutionOutcome::cancelled(host, started.elapsed(), retries);
                    }
                }
            }
        };

        state.discard_session().await;
        outcome
    }
}

/// Copy an existing file aside before it is overwritten. Best effort.
async fn backup_remote_file(host: &Host, session: &mut dyn Session, remote_path: &str) {
    let backup_path = format!("{}.bak", remote_path);
    let command = format!(
        "if [ -e {path} ]; then cp -p {path} {bak}; fi",
        path = shell_quote(remote_path),
        bak = shell_quote(&backup_path)
    );

    match session.exec(&command).await {
        Ok(output) if output.exit_code == 0 => {
            info!(host = %host.id(), backup = %backup_path, "Backed up existing file");
        }
        Ok(output) => {
            warn!(
                host = %host.id(),
                path = %remote_path,
                stderr = %output.stderr.trim(),
                "Backup failed, continuing with deploy"
            );
        }
        Err(e) => {
            warn!(host = %host.id(), path = %remote_path, error = %e, "Backup failed, continuing with deploy");
        }
    }
}

/// `exit status N: <first line of stderr, else stdout>`
fn failure_detail(output: &CommandOutput) -> String {
    let line = output
        .stderr
        .trim()
        .lines()
        .next()
        .or_else(|| output.stdout.trim().lines().next());
    match line {
        Some(line) => format!("exit status {}: {}", output.exit_code, line),
        None => format!("exit status {}", output.exit_code),
    }
}

fn remote_parent(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    let parent = &path[..idx];
    (!parent.is_empty()).then_some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, Step};

    fn executor(transport: &Arc<ScriptedTransport>, attempts: u32) -> RemoteExecutor {
        RemoteExecutor::new(transport.clone()).with_retry(RetryPolicy::immediate(attempts))
    }

    fn host() -> Host {
        Host::remote("10.0.0.1", "ubuntu")
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("10.0.0.1", vec![Step::ok("hello\n")]);

        let op = Operation::command("echo", "echo hello");
        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.retries, 0);
        assert_eq!(transport.commands("10.0.0.1"), vec!["echo hello"]);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_two_timeouts_then_success() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "10.0.0.1",
            vec![
                Step::Exec(Err(TransportError::Timeout)),
                Step::Exec(Err(TransportError::Timeout)),
                Step::ok("done"),
            ],
        );

        let op = Operation::command("job", "run-job");
        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.retries, 2);
        // each failed attempt discarded its session
        assert_eq!(transport.connects(), 3);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_timeouts_exceeding_budget_report_timed_out() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "10.0.0.1",
            vec![
                Step::Exec(Err(TransportError::Timeout)),
                Step::Exec(Err(TransportError::Timeout)),
                Step::Exec(Err(TransportError::Timeout)),
                Step::ok("too late"),
            ],
        );

        let op = Operation::command("job", "run-job");
        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert_eq!(outcome.retries, 2);
        assert!(outcome.stdout.is_empty());
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_wall_clock_timeout_is_enforced() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("10.0.0.1", vec![Step::Hang, Step::Hang]);

        let op = Operation::command("slow", "sleep 60").with_timeout(Duration::from_millis(30));
        let started = Instant::now();
        let outcome = executor(&transport, 2)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_and_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "10.0.0.1",
            vec![Step::Exec(Ok(CommandOutput {
                stdout: String::new(),
                stderr: "Unit nginx.service not found.".to_string(),
                exit_code: 5,
            }))],
        );

        let op = Operation::command("start", "systemctl start nginx");
        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.exit_code, Some(5));
        assert_eq!(outcome.stderr, "Unit nginx.service not found.");
        assert_eq!(
            outcome.reason(),
            "exit status 5: Unit nginx.service not found."
        );
        assert_eq!(outcome.retries, 0);
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_is_immediate_connection_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "10.0.0.1",
            vec![Step::Connect(TransportError::Auth("key rejected".into()))],
        );

        let op = Operation::command("echo", "echo hi");
        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::ConnectionError);
        assert_eq!(outcome.retries, 0);
        assert_eq!(transport.connects(), 1);
        assert!(outcome.error.unwrap().contains("key rejected"));
    }

    #[tokio::test]
    async fn test_refused_connections_exhaust_to_connection_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let refused = || Step::Connect(TransportError::Refused("port 22".into()));
        transport.script("10.0.0.1", vec![refused(), refused(), refused()]);

        let op = Operation::command("echo", "echo hi");
        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::ConnectionError);
        assert_eq!(outcome.retries, 2);
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_closes_session() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("10.0.0.1", vec![Step::Hang]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let op = Operation::command("slow", "sleep 60").with_timeout(Duration::from_secs(30));
        let outcome = executor(&transport, 3).execute(&host(), &op, &cancel).await;

        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
        assert!(outcome.stdout.is_empty());
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_deploy_backs_up_creates_parent_and_uploads() {
        let transport = Arc::new(ScriptedTransport::new());
        let op = Operation::deploy(b"{\"port\": 8080}".to_vec(), "/etc/app/config.json", true)
            .unwrap();

        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        let commands = transport.commands("10.0.0.1");
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("cp -p '/etc/app/config.json' '/etc/app/config.json.bak'"));
        assert_eq!(commands[1], "mkdir -p '/etc/app'");
        assert_eq!(
            transport.uploads("10.0.0.1"),
            vec![(
                "/etc/app/config.json".to_string(),
                b"{\"port\": 8080}".to_vec()
            )]
        );
    }

    #[tokio::test]
    async fn test_deploy_backup_failure_is_not_fatal() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "10.0.0.1",
            vec![Step::Exec(Ok(CommandOutput {
                stdout: String::new(),
                stderr: "cp: permission denied".to_string(),
                exit_code: 1,
            }))],
        );
        let op = Operation::deploy(b"data".to_vec(), "/srv/app.conf", true).unwrap();

        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(transport.uploads("10.0.0.1").len(), 1);
    }

    #[tokio::test]
    async fn test_deploy_rejected_upload_is_failed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "10.0.0.1",
            vec![Step::Upload(Err(TransportError::Rejected(
                "read-only file system".into(),
            )))],
        );
        let op = Operation::deploy(b"data".to_vec(), "/srv/app.conf", false).unwrap();

        let outcome = executor(&transport, 3)
            .execute(&host(), &op, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.retries, 0);
        // no backup requested: only the mkdir ran
        assert_eq!(transport.commands("10.0.0.1"), vec!["mkdir -p '/srv'"]);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(RetryPolicy::immediate(3).delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/etc/app/config.json"), Some("/etc/app"));
        assert_eq!(remote_parent("/config.json"), None);
        assert_eq!(remote_parent("config.json"), None);
    }
}
