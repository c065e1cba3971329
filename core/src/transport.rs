//! Transport sessions
//!
//! The executor talks to hosts through [`Transport`] / [`Session`] so the
//! retry and timeout discipline is the same for SSH, local shells and the
//! scripted transport used in tests.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::ssh::SshTransport;
use crate::{Host, OutcomeStatus};

/// Captured result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Transport-level failure, classified for the retry loop
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Refused connections, timeouts and protocol hiccups are worth another
    /// attempt; bad credentials, bad addresses and remote rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Refused(_) | TransportError::Timeout | TransportError::Transport(_)
        )
    }

    /// Outcome status reported when this is the final error
    pub fn status(&self) -> OutcomeStatus {
        match self {
            TransportError::Timeout => OutcomeStatus::TimedOut,
            TransportError::Rejected(_) => OutcomeStatus::Failed,
            TransportError::Auth(_)
            | TransportError::Unreachable(_)
            | TransportError::Refused(_)
            | TransportError::Transport(_) => OutcomeStatus::ConnectionError,
        }
    }
}

/// Opens sessions to hosts
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError>;
}

/// An open session to one host
#[async_trait]
pub trait Session: Send {
    /// Run a command to completion
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Write `payload` to `remote_path` (parent directory must exist)
    async fn upload(&mut self, payload: &[u8], remote_path: &str) -> Result<(), TransportError>;

    /// Close the session; must be safe to call after a failed exec
    async fn close(&mut self);
}

/// Runs commands on this machine through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError> {
        debug!(host = %host.id(), "Opening local session");
        Ok(Box::new(LocalSession))
    }
}

struct LocalSession;

#[async_trait]
impl Session for LocalSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        debug!(command = %command, "Executing locally");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TransportError::Transport(format!("failed to spawn sh: {}", e)))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&mut self, payload: &[u8], remote_path: &str) -> Result<(), TransportError> {
        tokio::fs::write(Path::new(remote_path), payload)
            .await
            .map_err(|e| TransportError::Rejected(format!("write {}: {}", remote_path, e)))
    }

    async fn close(&mut self) {}
}

/// SSH for remote hosts, `sh -c` for hosts flagged `local`
#[derive(Debug, Clone, Default)]
pub struct DefaultTransport {
    ssh: SshTransport,
    local: LocalTransport,
}

impl DefaultTransport {
    pub fn new(ssh: SshTransport) -> Self {
        Self {
            ssh,
            local: LocalTransport,
        }
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError> {
        if host.local {
            self.local.connect(host).await
        } else {
            self.ssh.connect(host).await
        }
    }
}
