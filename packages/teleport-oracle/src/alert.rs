//! Operator-visible alert channel
//!
//! FAILED relays and PENDING records found at startup represent value still
//! owed to someone; they are always logged at error level and, when a
//! webhook is configured, posted there too. Delivery failures never stop
//! the relay.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const WEBHOOK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub message: String,
}

impl Alert {
    pub fn critical(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            event_id: Some(event_id.into()),
            message: message.into(),
        }
    }

    /// The relay itself is stopping
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            event_id: None,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            event_id: None,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: Alert);
}

/// Alerts as structured error logs only
#[derive(Debug, Default, Clone)]
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn send(&self, alert: Alert) {
        log_alert(&alert);
    }
}

fn log_alert(alert: &Alert) {
    error!(
        severity = ?alert.severity,
        event_id = alert.event_id.as_deref().unwrap_or("-"),
        message = %alert.message,
        "OPERATOR ALERT"
    );
}

/// Alerts logged and posted as JSON to a webhook
pub struct WebhookAlerts {
    client: Client,
    url: String,
    retry_delay: Duration,
}

impl WebhookAlerts {
    pub fn new(url: impl Into<String>) -> eyre::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry_delay: Duration::from_secs(2),
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl AlertSink for WebhookAlerts {
    async fn send(&self, alert: Alert) {
        log_alert(&alert);

        for attempt in 1..=WEBHOOK_ATTEMPTS {
            match self.client.post(&self.url).json(&alert).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => warn!(
                    attempt,
                    status = %resp.status(),
                    "Alert webhook rejected alert"
                ),
                Err(e) => warn!(attempt, error = %e, "Alert webhook unreachable"),
            }
            if attempt < WEBHOOK_ATTEMPTS {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }
        error!(
            event_id = alert.event_id.as_deref().unwrap_or("-"),
            "Failed to deliver alert webhook after {} attempts", WEBHOOK_ATTEMPTS
        );
    }
}

/// Build the configured sink
pub fn from_config(webhook_url: Option<&str>) -> eyre::Result<Arc<dyn AlertSink>> {
    Ok(match webhook_url {
        Some(url) => Arc::new(WebhookAlerts::new(url)?),
        None => Arc::new(LogAlerts),
    })
}
