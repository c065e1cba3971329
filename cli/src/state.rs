//! File-backed alert cooldown state
//!
//! Each monitoring run is a fresh process, so last-notified timestamps live in
//! a small JSON file. Writes go to a sibling temp file and are renamed into
//! place.
//!
//! Entries are never evicted on admission. Each run may use its own window,
//! so only the run that looks an entry up can tell whether it has expired.
//! The file holds at most one record per (host, service, metric).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetctl_core::cooldown::is_expired;
use fleetctl_core::{CooldownKey, CooldownStore, Error, Metric, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service: Option<String>,
    metric: Metric,
    last_notified: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FileCooldownStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<CooldownKey, DateTime<Utc>>>,
}

impl FileCooldownStore {
    /// Open the state file; a missing or unreadable file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<Record>>(&bytes) {
                Ok(records) => records
                    .into_iter()
                    .map(|r| {
                        let key = CooldownKey {
                            host: r.host,
                            service: r.service,
                            metric: r.metric,
                        };
                        (key, r.last_notified)
                    })
                    .collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt cooldown state");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read cooldown state");
                BTreeMap::new()
            }
        };

        debug!(path = %path.display(), entries = entries.len(), "Loaded cooldown state");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<CooldownKey, DateTime<Utc>>) -> Result<()> {
        let records: Vec<Record> = entries
            .iter()
            .map(|(key, last)| Record {
                host: key.host.clone(),
                service: key.service.clone(),
                metric: key.metric,
                last_notified: *last,
            })
            .collect();
        let json = serde_json::to_vec_pretty(&records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::CooldownStoreError(format!("replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl CooldownStore for FileCooldownStore {
    async fn admit(
        &self,
        key: &CooldownKey,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if !is_expired(entries.get(key).copied(), now, window) {
            return Ok(false);
        }

        let previous = entries.insert(key.clone(), now);

        if let Err(e) = self.persist(&entries).await {
            // Leave memory consistent with disk
            match previous {
                Some(last) => entries.insert(key.clone(), last),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(true)
    }

    async fn last_notified(&self, key: &CooldownKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entries.lock().await.get(key).copied())
    }
}
