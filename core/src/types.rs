//! Shared types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "ubuntu".to_string()
}

/// Host inventory record
///
/// Immutable once loaded. The core only borrows hosts; the inventory
/// collaborator owns them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    /// Hostname or IP address, also the host's identity
    pub address: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login principal
    #[serde(default = "default_user")]
    pub user: String,
    /// Private key file (supports `~/`)
    #[serde(default)]
    pub key_path: Option<String>,
    /// Name of the secret (env var or `_FILE` var) holding a password
    #[serde(default)]
    pub password_secret: Option<String>,
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,
    /// Run commands on this machine instead of over SSH
    #[serde(default)]
    pub local: bool,
    /// Position in the environment's host list
    #[serde(skip)]
    pub index: usize,
}

impl Host {
    /// Create a remote host reached over SSH
    pub fn remote(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: default_port(),
            user: user.into(),
            key_path: None,
            password_secret: None,
            name: None,
            local: false,
            index: 0,
        }
    }

    /// Create a host that runs commands locally
    pub fn local(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address: "localhost".to_string(),
            name: Some(name),
            local: true,
            ..Self::remote("localhost", default_user())
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_key(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Identity used for outcomes and cooldown keys
    pub fn id(&self) -> &str {
        &self.address
    }

    /// Get display string for host
    pub fn display(&self) -> String {
        match (&self.name, self.local) {
            (Some(name), true) => format!("{} (local)", name),
            (Some(name), false) => format!("{} ({}@{})", name, self.user, self.address),
            (None, true) => format!("{} (local)", self.address),
            (None, false) => format!("{}@{}", self.user, self.address),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Terminal status of one operation on one host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Command ran and satisfied the operation's success predicate
    Success,
    /// Command ran but signaled failure; never retried
    Failed,
    /// Every attempt in the budget timed out (or the last one did)
    TimedOut,
    /// Unreachable, refused after retries, or authentication rejected
    ConnectionError,
    /// Dispatch was cancelled before this host finished
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::TimedOut => "timed_out",
            OutcomeStatus::ConnectionError => "connection_error",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one operation against one host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    /// Host identity
    pub host: String,
    pub status: OutcomeStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    /// Retries consumed (attempts - 1)
    pub retries: u32,
    /// Failure detail for non-success outcomes
    pub error: Option<String>,
    /// When the host's last attempt ended
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// Outcome for a host that never finished because the dispatch was cancelled
    pub fn cancelled(host: &Host, elapsed: Duration, retries: u32) -> Self {
        Self {
            host: host.id().to_string(),
            status: OutcomeStatus::Cancelled,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            elapsed_ms: elapsed.as_millis() as u64,
            retries,
            error: Some("operation cancelled".to_string()),
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Short human-readable reason for a failure, falling back to stderr
    pub fn reason(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.lines().next().unwrap_or_default().to_string();
        }
        self.status.to_string()
    }
}

/// Aggregate verdict of a fleet dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    AllSucceeded,
    PartialFailure,
    AllFailed,
}

impl Verdict {
    fn from_outcomes<'a>(outcomes: impl Iterator<Item = &'a ExecutionOutcome>) -> Self {
        let (mut ok, mut failed) = (0usize, 0usize);
        for outcome in outcomes {
            if outcome.is_success() {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        match (ok, failed) {
            (_, 0) => Verdict::AllSucceeded,
            (0, _) => Verdict::AllFailed,
            _ => Verdict::PartialFailure,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::AllSucceeded => "all succeeded",
            Verdict::PartialFailure => "partial failure",
            Verdict::AllFailed => "all failed",
        };
        f.write_str(s)
    }
}

/// One row of a [`FleetResult`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetEntry {
    pub host: Host,
    pub outcome: ExecutionOutcome,
}

/// Ordered per-host outcomes of one dispatch call plus the overall verdict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetResult {
    entries: Vec<FleetEntry>,
    verdict: Verdict,
    cancelled: bool,
}

impl FleetResult {
    /// Build the result; entries must already be in dispatch order.
    pub fn new(entries: Vec<FleetEntry>, cancelled: bool) -> Self {
        let mut verdict = Verdict::from_outcomes(entries.iter().map(|e| &e.outcome));
        let any_cancelled = entries
            .iter()
            .any(|e| e.outcome.status == OutcomeStatus::Cancelled);
        if cancelled && any_cancelled {
            verdict = Verdict::PartialFailure;
        }
        Self {
            entries,
            verdict,
            cancelled,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Whether the dispatch observed a cancellation request
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn entries(&self) -> &[FleetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &ExecutionOutcome> {
        self.entries.iter().map(|e| &e.outcome)
    }

    /// Entries that did not succeed, in dispatch order
    pub fn failures(&self) -> impl Iterator<Item = &FleetEntry> {
        self.entries.iter().filter(|e| !e.outcome.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.outcomes().filter(|o| o.is_success()).count()
    }
}
