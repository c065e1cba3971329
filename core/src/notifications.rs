//! Alert notification with log, Gotify, ntfy.sh and webhook backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::health::{AlertCondition, Comparison, Metric};
use crate::ssh::get_secret;
use crate::{Error, Result};

// ============================================================================
// Alert payload
// ============================================================================

/// Everything a notifier needs to deliver one alert
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertPayload {
    pub host: String,
    pub metric: Metric,
    pub observed: f64,
    pub threshold: f64,
    pub comparison: Comparison,
    pub timestamp: DateTime<Utc>,
    /// Service the metric was sampled for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl AlertPayload {
    pub fn from_condition(condition: &AlertCondition) -> Self {
        Self {
            host: condition.host.clone(),
            metric: condition.metric,
            observed: condition.observed,
            threshold: condition.limit,
            comparison: condition.comparison,
            timestamp: condition.first_detected,
            service: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Headline worded after the direction of the crossed rule
    pub fn title(&self) -> String {
        let resource = match self.metric {
            Metric::Cpu => "CPU",
            Metric::Memory => "memory",
            Metric::ServiceActive if self.observed < 1.0 => "Service down",
            Metric::ServiceActive => "Service running",
        };
        let what = match (self.metric, self.comparison) {
            (Metric::ServiceActive, _) => resource.to_string(),
            (_, Comparison::Ge | Comparison::Gt) => format!("High {}", resource),
            (_, Comparison::Le | Comparison::Lt) => format!("Low {}", resource),
            (_, Comparison::Eq) => format!("{} at {}%", capitalize(resource), self.threshold),
        };
        match &self.service {
            Some(service) => format!("{}: {} on {}", what, service, self.host),
            None => format!("{} on {}", what, self.host),
        }
    }

    pub fn body(&self) -> String {
        let observed = match self.metric {
            Metric::ServiceActive if self.observed < 1.0 => "inactive".to_string(),
            Metric::ServiceActive => "active".to_string(),
            _ => format!("{:.1}%", self.observed),
        };
        format!(
            "{} is {} (alert when {} {})\nDetected at {}",
            self.metric,
            observed,
            self.comparison,
            self.threshold,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Service outages page louder than resource pressure
    pub fn priority(&self) -> u8 {
        match self.metric {
            Metric::ServiceActive => 5,
            _ => 4,
        }
    }
}

/// Mask sensitive tokens/keys for safe logging
///
/// Masks all but the first and last 3 characters of tokens longer than 8 characters.
/// Tokens 8 characters or shorter are completely masked.
pub fn mask_token(token: &str) -> String {
    let chars = token.chars().count();
    if chars <= 8 {
        return "***".to_string();
    }
    let head: String = token.chars().take(3).collect();
    let tail: String = token.chars().skip(chars - 3).collect();
    format!("{}***{}", head, tail)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Delivers alerts somewhere
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &AlertPayload) -> Result<()>;

    /// Backend name
    fn name(&self) -> &str;
}

// ============================================================================
// Log Backend
// ============================================================================

/// Writes alerts to the log; used when nothing else is configured
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        warn!(
            host = %alert.host,
            metric = %alert.metric,
            observed = alert.observed,
            threshold = alert.threshold,
            service = ?alert.service,
            "ALERT: {}",
            alert.title()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ============================================================================
// Gotify Backend
// ============================================================================

/// Gotify notification backend
#[derive(Debug, Clone)]
pub struct GotifyBackend {
    client: Client,
    base_url: String,
    key: String,
}

impl GotifyBackend {
    pub fn new(client: Client, url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: url.into(),
            key: key.into(),
        }
    }

    fn message_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/message").unwrap_or(base);
        format!("{}/message", base)
    }
}

#[async_trait]
impl AlertNotifier for GotifyBackend {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let url = self.message_url();
        debug!(url = %url, key = %mask_token(&self.key), "Sending Gotify notification");

        let response = self
            .client
            .post(&url)
            .header("X-Gotify-Key", &self.key)
            .json(&serde_json::json!({
                "title": alert.title(),
                "message": alert.body(),
                "priority": alert.priority(),
            }))
            .send()
            .await
            .map_err(|e| Error::HttpError(format!("Gotify request failed: {}", e)))?;

        response
            .error_for_status()
            .map_err(|e| Error::NotificationError(format!("Gotify error: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        "gotify"
    }
}

// ============================================================================
// ntfy Backend
// ============================================================================

/// ntfy authentication methods
#[derive(Debug, Clone)]
pub enum NtfyAuth {
    /// Bearer token authentication
    Token(String),
    /// Basic authentication (username:password)
    Basic { username: String, password: String },
}

/// ntfy.sh notification backend
#[derive(Debug, Clone)]
pub struct NtfyBackend {
    client: Client,
    base_url: String,
    topic: String,
    auth: Option<NtfyAuth>,
}

impl NtfyBackend {
    pub fn new(client: Client, url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            client,
            base_url: url.into(),
            topic: topic.into(),
            auth: None,
        }
    }

    /// Set token authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(NtfyAuth::Token(token.into()));
        self
    }

    /// Set basic authentication
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = Some(NtfyAuth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

#[async_trait]
impl AlertNotifier for NtfyBackend {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let tags = match alert.metric {
            Metric::ServiceActive => vec!["rotating_light"],
            _ => vec!["warning"],
        };
        // Topic travels in the JSON body, so post to the base URL
        let body = serde_json::json!({
            "topic": self.topic,
            "title": alert.title(),
            "message": alert.body(),
            "priority": alert.priority(),
            "tags": tags,
        });

        let url = self.base_url.trim_end_matches('/');
        let mut request = self.client.post(url).json(&body);

        match &self.auth {
            Some(NtfyAuth::Token(token)) => {
                debug!(token = %mask_token(token), "Using Bearer token authentication");
                request = request.header("Authorization", format!("Bearer {}", token));
            }
            Some(NtfyAuth::Basic { username, password }) => {
                debug!(username = %username, "Using Basic authentication");
                request = request.basic_auth(username, Some(password));
            }
            None => {}
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::HttpError(format!("ntfy request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::NotificationError(format!(
                "ntfy error: {} - {}",
                status, error_body
            )));
        }

        info!(topic = %self.topic, host = %alert.host, "ntfy notification sent");
        Ok(())
    }

    fn name(&self) -> &str {
        "ntfy"
    }
}

// ============================================================================
// Webhook Backend
// ============================================================================

/// Posts the raw [`AlertPayload`] as JSON
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::HttpError(format!("webhook request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::NotificationError(format!("webhook error: {}", e)))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

// ============================================================================
// Notification Manager
// ============================================================================

/// Backend settings, normally read from the environment
#[derive(Debug, Clone, Default)]
pub struct NotifierSettings {
    pub ntfy_url: Option<String>,
    pub ntfy_topic: Option<String>,
    pub ntfy_token: Option<String>,
    pub ntfy_username: Option<String>,
    pub ntfy_password: Option<String>,
    pub gotify_url: Option<String>,
    pub gotify_key: Option<String>,
    pub webhook_url: Option<String>,
}

impl NotifierSettings {
    /// Read `NTFY_*`, `GOTIFY_*` and `ALERT_WEBHOOK_URL`; secrets may come
    /// from `*_FILE` variables.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secret = |name: &str| get_secret(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            ntfy_url: var("NTFY_URL"),
            ntfy_topic: var("NTFY_TOPIC"),
            ntfy_token: secret("NTFY_TOKEN"),
            ntfy_username: var("NTFY_USERNAME"),
            ntfy_password: secret("NTFY_PASSWORD"),
            gotify_url: var("GOTIFY_URL"),
            gotify_key: secret("GOTIFY_KEY"),
            webhook_url: var("ALERT_WEBHOOK_URL"),
        }
    }
}

/// Fans alerts out to every configured backend
#[derive(Clone, Default)]
pub struct NotificationManager {
    backends: Vec<Arc<dyn AlertNotifier>>,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build backends from settings; falls back to [`LogNotifier`] when none
    /// is configured.
    pub fn from_settings(client: Client, settings: &NotifierSettings) -> Self {
        let mut manager = Self::new();

        if let Some(topic) = &settings.ntfy_topic {
            let url = settings
                .ntfy_url
                .clone()
                .unwrap_or_else(|| "https://ntfy.sh".to_string());
            let mut backend = NtfyBackend::new(client.clone(), url, topic.clone());
            if let Some(token) = &settings.ntfy_token {
                backend = backend.with_token(token.clone());
            } else if let (Some(user), Some(pass)) = (&settings.ntfy_username, &settings.ntfy_password) {
                backend = backend.with_basic_auth(user.clone(), pass.clone());
            }
            manager = manager.with_backend(Arc::new(backend));
        }

        if let (Some(url), Some(key)) = (&settings.gotify_url, &settings.gotify_key) {
            manager = manager.with_backend(Arc::new(GotifyBackend::new(
                client.clone(),
                url.clone(),
                key.clone(),
            )));
        }

        if let Some(url) = &settings.webhook_url {
            manager = manager.with_backend(Arc::new(WebhookNotifier::new(client, url.clone())));
        }

        if manager.backends.is_empty() {
            manager = manager.with_backend(Arc::new(LogNotifier));
        }

        info!(backends = ?manager.names(), "Notification backends configured");
        manager
    }

    pub fn with_backend(mut self, backend: Arc<dyn AlertNotifier>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

#[async_trait]
impl AlertNotifier for NotificationManager {
    /// Deliver to every backend; one backend failing does not stop the rest
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let mut errors = Vec::new();

        for backend in &self.backends {
            if let Err(e) = backend.notify(alert).await {
                warn!(backend = backend.name(), host = %alert.host, error = %e, "Notification failed");
                errors.push(format!("{}: {}", backend.name(), e));
            }
        }

        if !errors.is_empty() {
            return Err(Error::NotificationError(errors.join("; ")));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "manager"
    }
}
