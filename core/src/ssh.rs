//! SSH transport for remote hosts

use async_ssh2_tokio::{client::Client, AuthMethod, Error as SshClientError, ServerCheckMethod};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::transport::{CommandOutput, Session, Transport, TransportError};
use crate::Host;

/// Keys tried, in order, when neither the host nor the transport names one
const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opens SSH sessions with key or password authentication
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    /// Fallback key when the host record has none
    default_key_path: Option<String>,
    /// Verify host keys against `~/.ssh/known_hosts`
    strict_host_keys: bool,
}

impl SshTransport {
    pub fn new(default_key_path: Option<String>) -> Self {
        Self {
            default_key_path,
            strict_host_keys: false,
        }
    }

    pub fn with_strict_host_keys(mut self, strict: bool) -> Self {
        self.strict_host_keys = strict;
        self
    }

    fn server_check(&self) -> ServerCheckMethod {
        if self.strict_host_keys {
            ServerCheckMethod::DefaultKnownHostsFile
        } else {
            ServerCheckMethod::NoCheck
        }
    }

    /// Candidate authentication methods for a host, most specific first
    fn auth_methods(&self, host: &Host) -> Result<Vec<(String, AuthMethod)>, TransportError> {
        if let Some(secret) = &host.password_secret {
            let password = get_secret(secret).ok_or_else(|| {
                TransportError::Auth(format!("password secret {} is not set", secret))
            })?;
            return Ok(vec![(
                format!("password:{}", secret),
                AuthMethod::with_password(&password),
            )]);
        }

        if let Some(key_path) = host.key_path.as_ref().or(self.default_key_path.as_ref()) {
            let path = expand_home(key_path);
            if !path.exists() {
                return Err(TransportError::Auth(format!(
                    "SSH key not found: {}",
                    path.display()
                )));
            }
            let label = path.display().to_string();
            let auth = AuthMethod::with_key_file(&label, None);
            return Ok(vec![(label, auth)]);
        }

        let ssh_dir = expand_home("~/.ssh");
        let keys: Vec<_> = DEFAULT_KEYS
            .iter()
            .map(|name| ssh_dir.join(name))
            .filter(|path| path.exists())
            .map(|path| {
                let label = path.display().to_string();
                let auth = AuthMethod::with_key_file(&label, None);
                (label, auth)
            })
            .collect();

        if keys.is_empty() {
            return Err(TransportError::Auth(format!(
                "No SSH keys found in {}",
                ssh_dir.display()
            )));
        }
        Ok(keys)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, TransportError> {
        let methods = self.auth_methods(host)?;
        let mut last_error = None;

        for (label, auth) in methods {
            debug!(host = %host.id(), port = host.port, auth = %label, "Connecting via SSH");

            match Client::connect(
                (host.address.clone(), host.port),
                &host.user,
                auth,
                self.server_check(),
            )
            .await
            {
                Ok(client) => {
                    info!(host = %host.id(), auth = %label, "SSH session established");
                    return Ok(Box::new(SshSession {
                        client,
                        host: host.id().to_string(),
                    }));
                }
                Err(e) => {
                    let err = classify_error(e);
                    // Only an auth rejection makes the next key worth trying
                    if !matches!(err, TransportError::Auth(_)) {
                        return Err(err);
                    }
                    debug!(host = %host.id(), auth = %label, error = %err, "Key rejected");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Auth("no usable credentials".into())))
    }
}

struct SshSession {
    client: Client,
    host: String,
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        debug!(host = %self.host, command = %command, "Executing remotely via SSH");

        let result = self.client.execute(command).await.map_err(classify_error)?;

        Ok(CommandOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_status as i32,
        })
    }

    async fn upload(&mut self, payload: &[u8], remote_path: &str) -> Result<(), TransportError> {
        let staging = std::env::temp_dir().join(format!(
            "fleetctl-{}-{}.upload",
            std::process::id(),
            UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&staging, payload)
            .await
            .map_err(|e| TransportError::Rejected(format!("staging payload: {}", e)))?;

        let result = self
            .client
            .upload_file(&staging, remote_path.to_string())
            .await
            .map_err(|e| TransportError::Rejected(format!("upload to {}: {}", remote_path, e)));

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
        }
        result
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(host = %self.host, error = %e, "SSH disconnect failed");
        }
    }
}

fn classify_error(err: SshClientError) -> TransportError {
    match err {
        SshClientError::KeyAuthFailed
        | SshClientError::PasswordWrong
        | SshClientError::KeyInvalid(_) => TransportError::Auth(err.to_string()),
        SshClientError::AddressInvalid(_) => TransportError::Unreachable(err.to_string()),
        other => {
            let message = other.to_string();
            if message.to_lowercase().contains("refused") {
                TransportError::Refused(message)
            } else {
                TransportError::Transport(message)
            }
        }
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/").or_else(|| (path == "~").then_some("")) {
        Some(rest) => {
            let home = std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_else(|_| "/root".to_string());
            Path::new(&home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

/// Get secret from environment variable or file
///
/// If `VAR_NAME` is not set, tries `VAR_NAME_FILE`, which should point to a
/// file containing the secret (Docker / Kubernetes secrets).
pub fn get_secret(var_name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(var_name) {
        return Some(value);
    }

    let file_var = format!("{}_FILE", var_name);
    if let Ok(path) = std::env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }

    None
}
