//! Operation values
//!
//! An [`Operation`] is everything the executor needs to run one piece of work
//! on a host: the action, the predicate that decides success, and a timeout.
//! Service lifecycle commands and config deploys are just constructors here,
//! so the executor and dispatcher never branch on what the work is.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::transport::CommandOutput;
use crate::{Error, Result};

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do on the host
#[derive(Debug, Clone)]
pub enum Action {
    /// Run a shell command line
    Command(String),
    /// Write `payload` to `remote_path`, optionally backing up the old file
    Upload {
        payload: Arc<[u8]>,
        remote_path: String,
        backup: bool,
    },
}

/// Decides whether a command that ran to completion succeeded
#[derive(Debug, Clone)]
pub enum SuccessPredicate {
    /// Exit status 0
    ExitZero,
    /// Trimmed stdout equals the given text, whatever the exit status
    OutputEquals(String),
    /// Stdout matches the pattern, whatever the exit status
    OutputMatches(Regex),
}

impl SuccessPredicate {
    pub fn check(&self, output: &CommandOutput) -> bool {
        match self {
            SuccessPredicate::ExitZero => output.exit_code == 0,
            SuccessPredicate::OutputEquals(expected) => output.stdout.trim() == expected,
            SuccessPredicate::OutputMatches(pattern) => pattern.is_match(&output.stdout),
        }
    }
}

/// A unit of work to run against a host
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub action: Action,
    pub predicate: SuccessPredicate,
    pub timeout: Duration,
}

impl Operation {
    /// Arbitrary command, succeeding on exit status 0
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Action::Command(command.into()),
            predicate: SuccessPredicate::ExitZero,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn expect(mut self, predicate: SuccessPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `systemctl start|stop|restart <service>` through passwordless sudo
    pub fn service(action: ServiceAction, service: &str) -> Result<Self> {
        validate_service_name(service)?;
        Ok(Self::command(
            format!("{} {}", action.verb(), service),
            format!("sudo -n systemctl {} {}", action.verb(), shell_quote(service)),
        ))
    }

    /// `systemctl is-active <service>`, successful only when the unit is active
    pub fn service_status(service: &str) -> Result<Self> {
        validate_service_name(service)?;
        Ok(
            Self::command(
                format!("status {}", service),
                format!("systemctl is-active {}", shell_quote(service)),
            )
            .expect(SuccessPredicate::OutputEquals("active".to_string())),
        )
    }

    /// Upload an already rendered document to `remote_path`
    pub fn deploy(
        payload: impl Into<Arc<[u8]>>,
        remote_path: impl Into<String>,
        backup: bool,
    ) -> Result<Self> {
        let remote_path = remote_path.into();
        if remote_path.trim().is_empty() || remote_path.ends_with('/') {
            return Err(Error::InvalidOperation(format!(
                "deploy target must be a file path, got {:?}",
                remote_path
            )));
        }
        Ok(Self {
            name: format!("deploy {}", remote_path),
            action: Action::Upload {
                payload: payload.into(),
                remote_path,
                backup,
            },
            predicate: SuccessPredicate::ExitZero,
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

/// Mutating service lifecycle actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn verb(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

/// systemd unit state as reported by `systemctl`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Reloading,
    Unknown(String),
}

impl ServiceState {
    /// Parse `systemctl is-active` output, falling back to the
    /// `Active: <state>` line of `systemctl status`.
    pub fn parse(output: &str) -> Self {
        static ACTIVE_LINE: OnceLock<Regex> = OnceLock::new();

        let first = output.trim().lines().next().unwrap_or_default().trim();
        if let Some(state) = Self::from_word(first) {
            return state;
        }

        let re = ACTIVE_LINE.get_or_init(|| Regex::new(r"Active:\s+(\w+)").expect("static regex"));
        if let Some(state) = re
            .captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| Self::from_word(m.as_str()))
        {
            return state;
        }

        if first.is_empty() {
            ServiceState::Unknown("unknown".to_string())
        } else {
            ServiceState::Unknown(first.to_string())
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "active" => Some(ServiceState::Active),
            "inactive" => Some(ServiceState::Inactive),
            "failed" => Some(ServiceState::Failed),
            "activating" => Some(ServiceState::Activating),
            "deactivating" => Some(ServiceState::Deactivating),
            "reloading" => Some(ServiceState::Reloading),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ServiceState::Active | ServiceState::Reloading)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Active => f.write_str("active"),
            ServiceState::Inactive => f.write_str("inactive"),
            ServiceState::Failed => f.write_str("failed"),
            ServiceState::Activating => f.write_str("activating"),
            ServiceState::Deactivating => f.write_str("deactivating"),
            ServiceState::Reloading => f.write_str("reloading"),
            ServiceState::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

/// Service names end up inside shell command lines; only unit-name
/// characters are accepted.
pub fn validate_service_name(service: &str) -> Result<()> {
    let valid = !service.is_empty()
        && !service.starts_with('-')
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidServiceName(service.to_string()))
    }
}

/// Single-quote a value for POSIX sh
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
