//! Core library for fleetctl
//!
//! Remote-operation engine: runs [`Operation`]s on hosts with retry and
//! timeout discipline, fans them out across a fleet, samples service metrics,
//! evaluates threshold rules and gates alerts behind a per-(host, metric)
//! cooldown.

pub mod cooldown;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod notifications;
pub mod operation;
pub mod remote;
pub mod ssh;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use cooldown::{AlertSummary, CooldownKey, CooldownStore, CooldownTracker, InMemoryCooldownStore};
pub use dispatch::{DispatchMode, FleetDispatcher};
pub use error::{Error, Result};
pub use health::{evaluate, AlertCondition, Comparison, Evaluation, HealthState, Metric, ThresholdRule};
pub use metrics::{HostSample, MetricSample, MetricsSampler};
pub use notifications::{
    mask_token, AlertNotifier, AlertPayload, GotifyBackend, LogNotifier, NotificationManager,
    NotifierSettings, NtfyBackend, WebhookNotifier,
};
pub use operation::{Operation, ServiceAction, ServiceState, SuccessPredicate};
pub use remote::{Executor, RemoteExecutor, RetryPolicy};
pub use ssh::SshTransport;
pub use transport::{DefaultTransport, LocalTransport, Transport};
pub use types::{ExecutionOutcome, FleetEntry, FleetResult, Host, OutcomeStatus, Verdict};
