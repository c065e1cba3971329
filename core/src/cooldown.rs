//! Alert cooldown
//!
//! Suppresses repeat notifications for the same (host, service, metric)
//! inside a window. The check-and-set lives in the [`CooldownStore`] so that a store
//! shared between concurrent evaluations, or persisted between runs, keeps the
//! "admit once per window" guarantee.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::health::{AlertCondition, Metric};
use crate::notifications::{AlertNotifier, AlertPayload};
use crate::{Error, Result};

/// Default cooldown window
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Cooldown identity of an alert
///
/// Metrics are sampled per service, so two services on one host cool down
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CooldownKey {
    pub host: String,
    pub service: Option<String>,
    pub metric: Metric,
}

impl CooldownKey {
    pub fn new(host: impl Into<String>, metric: Metric) -> Self {
        Self {
            host: host.into(),
            service: None,
            metric,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Key for a condition observed on `service`
    pub fn for_alert(condition: &AlertCondition, service: Option<&str>) -> Self {
        Self {
            host: condition.host.clone(),
            service: service.map(str::to_string),
            metric: condition.metric,
        }
    }
}

impl From<&AlertCondition> for CooldownKey {
    fn from(condition: &AlertCondition) -> Self {
        Self::for_alert(condition, None)
    }
}

impl fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "{}/{}/{}", self.host, service, self.metric),
            None => write!(f, "{}/{}", self.host, self.metric),
        }
    }
}

/// Admission rule shared by every store: no entry, or an entry strictly older
/// than `now - window`.
pub fn is_expired(last: Option<DateTime<Utc>>, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    match last {
        None => true,
        Some(last) => last < now - window,
    }
}

/// Storage for last-notified timestamps
#[async_trait]
pub trait CooldownStore: Send + Sync {
    /// Atomically: if the key is expired, record `now` and return true;
    /// otherwise leave the entry untouched and return false.
    async fn admit(
        &self,
        key: &CooldownKey,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<bool>;

    async fn last_notified(&self, key: &CooldownKey) -> Result<Option<DateTime<Utc>>>;
}

/// Process-local cooldown store
#[derive(Debug, Default)]
pub struct InMemoryCooldownStore {
    entries: Mutex<HashMap<CooldownKey, DateTime<Utc>>>,
}

impl InMemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose window has passed; returns how many were removed
    pub async fn evict_expired(&self, now: DateTime<Utc>, window: chrono::Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, last| !is_expired(Some(*last), now, window));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl CooldownStore for InMemoryCooldownStore {
    async fn admit(
        &self,
        key: &CooldownKey,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if is_expired(entries.get(key).copied(), now, window) {
            entries.insert(key.clone(), now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn last_notified(&self, key: &CooldownKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entries.lock().await.get(key).copied())
    }
}

/// Counts from one [`CooldownTracker::dispatch_alerts`] pass
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertSummary {
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// Gate between health evaluation and the notifier
#[derive(Clone)]
pub struct CooldownTracker {
    store: Arc<dyn CooldownStore>,
    window: chrono::Duration,
}

impl CooldownTracker {
    pub fn new(store: Arc<dyn CooldownStore>, window: Duration) -> Result<Self> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| Error::ConfigError(format!("cooldown window out of range: {}", e)))?;
        Ok(Self { store, window })
    }

    /// Tracker over a fresh in-memory store
    pub fn in_memory(window: Duration) -> Result<Self> {
        Self::new(Arc::new(InMemoryCooldownStore::new()), window)
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Whether this condition, seen on `service`, should be notified now
    pub async fn admit(
        &self,
        condition: &AlertCondition,
        service: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = CooldownKey::for_alert(condition, service);
        let admitted = self.store.admit(&key, now, self.window).await?;
        debug!(key = %key, admitted, "Cooldown check");
        Ok(admitted)
    }

    /// Forward every admitted alert to the notifier.
    ///
    /// Store and notifier failures are logged and counted; they do not stop
    /// the remaining alerts.
    #[instrument(skip_all, fields(alerts = alerts.len(), notifier = notifier.name()))]
    pub async fn dispatch_alerts(
        &self,
        alerts: &[AlertCondition],
        notifier: &dyn AlertNotifier,
        service: Option<&str>,
        now: DateTime<Utc>,
    ) -> AlertSummary {
        let mut summary = AlertSummary::default();

        for condition in alerts {
            match self.admit(condition, service, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(alert = %condition.summary(), "Alert suppressed by cooldown");
                    summary.suppressed += 1;
                    continue;
                }
                Err(e) => {
                    warn!(alert = %condition.summary(), error = %e, "Cooldown store failed");
                    summary.failed += 1;
                    continue;
                }
            }

            let mut payload = AlertPayload::from_condition(condition);
            if let Some(service) = service {
                payload = payload.with_service(service);
            }

            match notifier.notify(&payload).await {
                Ok(()) => {
                    info!(alert = %condition.summary(), "Alert sent");
                    summary.sent += 1;
                }
                Err(e) => {
                    warn!(alert = %condition.summary(), error = %e, "Alert delivery failed");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}
