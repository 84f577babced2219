// Operator notifications sent by the stuck-job sweep. Delivery is best
// effort: failures are reported to the caller, which only logs them.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NotificationConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification endpoint answered {0}")]
    Status(u16),
}

/// One report for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub org: String,
    pub subject: String,
    pub lines: Vec<String>,
}

impl Notification {
    pub fn render(&self) -> String {
        let mut text = format!("*{}*", self.subject);
        for line in &self.lines {
            text.push('\n');
            text.push_str(line);
        }
        text
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes reports to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        warn!(
            org = %notification.org,
            subject = %notification.subject,
            lines = notification.lines.len(),
            "{}",
            notification.render()
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts reports to a Slack-style incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let text = notification.render();
        let response = self
            .http
            .post(&self.url)
            .json(&WebhookPayload { text: &text })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        info!(org = %notification.org, "Notification delivered");
        Ok(())
    }
}

/// Webhook delivery when a URL is configured, log output otherwise.
pub fn sink_from_config(config: &NotificationConfig) -> Result<Box<dyn NotificationSink>, NotifyError> {
    match &config.webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.request_timeout_seconds),
        )?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
