//! Configuration management

use anyhow::{bail, Context};
use fleetctl_core::cooldown::DEFAULT_COOLDOWN;
use fleetctl_core::dispatch::DEFAULT_MAX_PARALLEL;
use fleetctl_core::ssh::get_secret;
use fleetctl_core::Host;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_inventory_dir() -> PathBuf {
    PathBuf::from("configs")
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".fleetctl/cooldown.json")
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN.as_secs()
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `<env>/hosts.toml`
    #[serde(default = "default_inventory_dir")]
    pub inventory_dir: PathBuf,

    /// SSH key used when a host names none
    #[serde(default)]
    pub ssh_key_path: Option<String>,

    /// Verify host keys against known_hosts
    #[serde(default)]
    pub strict_host_keys: bool,

    /// Hosts in flight at once for `--all`
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Attempts per host, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Default alert cooldown
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Where alert cooldown state survives between runs
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inventory_dir: default_inventory_dir(),
            ssh_key_path: None,
            strict_host_keys: false,
            max_parallel: default_max_parallel(),
            retry_attempts: default_retry_attempts(),
            timeout_secs: default_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
            state_file: default_state_file(),
        }
    }
}

impl Config {
    /// Load configuration from file or environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = if let Some(p) = path {
            Self::load_from_file(p)?
        } else {
            Self::load_from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from configuration file
    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load from `FLEETCTL_*` environment variables
    fn load_from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("FLEETCTL_INVENTORY_DIR") {
            config.inventory_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("FLEETCTL_STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }
        config.max_parallel = env_number("FLEETCTL_MAX_PARALLEL", config.max_parallel)?;
        config.retry_attempts = env_number("FLEETCTL_RETRY_ATTEMPTS", config.retry_attempts)?;
        config.timeout_secs = env_number("FLEETCTL_TIMEOUT_SECS", config.timeout_secs)?;
        config.cooldown_secs = env_number("FLEETCTL_COOLDOWN_SECS", config.cooldown_secs)?;
        config.strict_host_keys = std::env::var("FLEETCTL_STRICT_HOST_KEYS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        // Support file-based SSH key path (Docker/K8s secrets)
        config.ssh_key_path = get_secret("SSH_KEY_PATH");

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_parallel == 0 {
            bail!("max_parallel must be at least 1");
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Load the ordered host list of one environment
    pub fn load_hosts(&self, env: &str) -> anyhow::Result<Vec<Host>> {
        load_inventory(&self.inventory_dir, env)
    }
}

fn env_number<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    hosts: Vec<Host>,
}

/// Read `<dir>/<env>/hosts.toml` and number the hosts in file order
pub fn load_inventory(dir: &Path, env: &str) -> anyhow::Result<Vec<Host>> {
    let valid = !env.is_empty()
        && env
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        bail!("Invalid environment name {:?}", env);
    }

    let path = dir.join(env).join("hosts.toml");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read inventory {}", path.display()))?;
    let inventory: InventoryFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse inventory {}", path.display()))?;

    let hosts = inventory
        .hosts
        .into_iter()
        .enumerate()
        .map(|(index, host)| host.with_index(index))
        .collect::<Vec<_>>();

    for host in &hosts {
        if host.address.trim().is_empty() && !host.local {
            bail!("Host #{} in {} has no address", host.index, path.display());
        }
    }

    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fleetctl-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_inventory_keeps_file_order() {
        let dir = temp_dir("inventory");
        std::fs::create_dir_all(dir.join("prod")).unwrap();
        std::fs::write(
            dir.join("prod/hosts.toml"),
            r#"
[[hosts]]
address = "10.0.1.10"
name = "web-1"
key_path = "~/.ssh/prod"

[[hosts]]
address = "10.0.1.11"
user = "deploy"
port = 2222

[[hosts]]
address = "localhost"
local = true
"#,
        )
        .unwrap();

        let hosts = load_inventory(&dir, "prod").unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].address, "10.0.1.10");
        assert_eq!(hosts[0].user, "ubuntu");
        assert_eq!(hosts[1].index, 1);
        assert_eq!(hosts[1].port, 2222);
        assert_eq!(hosts[1].user, "deploy");
        assert!(hosts[2].local);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_inventory_rejects_path_tricks() {
        let dir = temp_dir("inventory-bad");
        assert!(load_inventory(&dir, "../etc").is_err());
        assert!(load_inventory(&dir, "").is_err());
        // missing file
        assert!(load_inventory(&dir, "staging").is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_defaults() {
        let config: Config = toml::from_str("max_parallel = 4").unwrap();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.inventory_dir, PathBuf::from("configs"));
        assert_eq!(config.cooldown_secs, 300);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = Config {
            max_parallel: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
