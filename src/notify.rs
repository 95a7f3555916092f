//! Alert notification transport
//!
//! The incident manager hands a finished [`AlertWebhookPayload`] to a
//! [`Notifier`] and only cares whether delivery succeeded. Retries live with
//! the caller so the transport stays a single attempt.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::Severity;

/// Body posted to the alert webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertWebhookPayload {
    /// Always `"alert"`
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub service: String,
    pub metric: String,
    pub current_value: f64,
    pub threshold: f64,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub dashboard_url: String,
}

impl AlertWebhookPayload {
    pub const KIND: &'static str = "alert";
}

#[derive(Debug)]
pub enum NotifyError {
    /// Request never got a response (connect, TLS, timeout)
    Transport(String),

    /// Endpoint answered with a non-success status
    Rejected(u16),

    /// Neither the threshold nor the configuration names a webhook
    NoDestination,
}

impl NotifyError {
    /// Is another attempt worth it?
    pub fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Transport(_) => true,
            NotifyError::Rejected(status) => *status == 429 || *status >= 500,
            NotifyError::NoDestination => false,
        }
    }
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Transport(msg) => write!(f, "webhook request failed: {}", msg),
            NotifyError::Rejected(status) => write!(f, "webhook rejected alert with status {}", status),
            NotifyError::NoDestination => write!(f, "no webhook url configured"),
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// One delivery attempt of `payload` to `url`
    async fn deliver(&self, url: &str, payload: &AlertWebhookPayload) -> Result<(), NotifyError>;
}

/// Posts payloads as JSON over HTTP
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, payload), fields(service = %payload.service, severity = %payload.severity))]
    async fn deliver(&self, url: &str, payload: &AlertWebhookPayload) -> Result<(), NotifyError> {
        let response = self.client.post(url).json(payload).send().await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }

        debug!("webhook accepted alert");
        Ok(())
    }
}
