//! Fleet dispatch
//!
//! Fans one [`Operation`] out to a single host or the whole fleet with a
//! bounded number of hosts in flight, then gathers the outcomes back in
//! inventory order.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::operation::Operation;
use crate::remote::Executor;
use crate::{Error, ExecutionOutcome, FleetEntry, FleetResult, Host, OutcomeStatus, Result};

/// Default cap on hosts in flight
pub const DEFAULT_MAX_PARALLEL: usize = 10;

/// Which hosts a dispatch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One host by its position in the inventory
    Single(usize),
    /// Every host in the inventory
    All,
}

/// Runs operations across a fleet through an [`Executor`]
#[derive(Clone)]
pub struct FleetDispatcher {
    executor: Arc<dyn Executor>,
    max_parallel: usize,
}

impl FleetDispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Set the concurrency cap (at least 1)
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Dispatch without external cancellation
    pub async fn dispatch(
        &self,
        hosts: &[Host],
        operation: &Operation,
        mode: DispatchMode,
    ) -> Result<FleetResult> {
        self.dispatch_with_cancel(hosts, operation, mode, &CancellationToken::new())
            .await
    }

    /// Dispatch an operation.
    ///
    /// Fails fast, before contacting any host, on an out-of-range index or an
    /// empty fleet. Per-host failures never fail the call; they are reported
    /// in the returned [`FleetResult`].
    #[instrument(skip(self, hosts, operation, cancel), fields(operation = %operation.name, hosts = hosts.len()))]
    pub async fn dispatch_with_cancel(
        &self,
        hosts: &[Host],
        operation: &Operation,
        mode: DispatchMode,
        cancel: &CancellationToken,
    ) -> Result<FleetResult> {
        let started = Instant::now();

        let result = match mode {
            DispatchMode::Single(index) => {
                let host = hosts.get(index).ok_or(Error::HostIndexOutOfRange {
                    index,
                    len: hosts.len(),
                })?;
                info!(host = %host.display(), "Dispatching to single host");

                let outcome = self.executor.execute(host, operation, cancel).await;
                FleetResult::new(
                    vec![FleetEntry {
                        host: host.clone(),
                        outcome,
                    }],
                    cancel.is_cancelled(),
                )
            }
            DispatchMode::All => {
                if hosts.is_empty() {
                    return Err(Error::EmptyFleet);
                }
                self.dispatch_all(hosts, operation, cancel).await
            }
        };

        info!(
            verdict = %result.verdict(),
            succeeded = result.success_count(),
            total = result.len(),
            cancelled = result.was_cancelled(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );

        Ok(result)
    }

    async fn dispatch_all(
        &self,
        hosts: &[Host],
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> FleetResult {
        let permits = hosts.len().min(self.max_parallel);
        let semaphore = Arc::new(Semaphore::new(permits));
        let operation = Arc::new(operation.clone());

        info!(permits, "Dispatching to all hosts");

        let handles: Vec<_> = hosts
            .iter()
            .cloned()
            .map(|host| {
                let executor = self.executor.clone();
                let operation = operation.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let queued = Instant::now();
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return ExecutionOutcome::cancelled(&host, queued.elapsed(), 0);
                    };
                    executor.execute(&host, &operation, &cancel).await
                })
            })
            .collect();

        // Awaiting in spawn order keeps outcomes aligned with the inventory
        let mut entries = Vec::with_capacity(hosts.len());
        for (host, handle) in hosts.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(host = %host.id(), error = %e, "Host worker failed");
                    worker_failure(host, &e.to_string())
                }
            };
            entries.push(FleetEntry {
                host: host.clone(),
                outcome,
            });
        }

        FleetResult::new(entries, cancel.is_cancelled())
    }
}

fn worker_failure(host: &Host, message: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        host: host.id().to_string(),
        status: OutcomeStatus::ConnectionError,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: None,
        elapsed_ms: 0,
        retries: 0,
        error: Some(format!("worker panicked: {}", message)),
        finished_at: Utc::now(),
    }
}
