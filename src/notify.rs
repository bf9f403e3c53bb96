//! Notification sink — mirrors important events to an external channel.
//!
//! The server loop reports cycle failures here in addition to the log.
//! Sink failures are logged and never fatal; losing a notification must
//! not take the scanner down.

use async_trait::async_trait;
use tracing::error;

use crate::error::NotifyError;

/// Severity of a mirrored event. Ordering follows the variant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Parse a config value. Unknown values are a config error upstream.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Somewhere to post severity-tagged events with key/value fields.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post(
        &self,
        severity: Severity,
        message: &str,
        fields: &[(&str, String)],
    ) -> Result<(), NotifyError>;
}

/// Severity-filtered front for an optional sink. With no sink configured
/// every post is a no-op.
pub struct Notifier {
    sink: Option<std::sync::Arc<dyn NotificationSink>>,
    send_level: Severity,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self {
            sink: None,
            send_level: Severity::Error,
        }
    }

    pub fn new(sink: std::sync::Arc<dyn NotificationSink>, send_level: Severity) -> Self {
        Self {
            sink: Some(sink),
            send_level,
        }
    }

    /// Post if the event clears the configured severity. Failures are
    /// logged, not propagated.
    pub async fn post(&self, severity: Severity, message: &str, fields: &[(&str, String)]) {
        let Some(ref sink) = self.sink else {
            return;
        };
        if severity < self.send_level {
            return;
        }
        if let Err(e) = sink.post(severity, message, fields).await {
            error!(error = %e, "Failed to post notification");
        }
    }
}

// ── Slack webhook adapter ───────────────────────────────────────────

#[derive(serde::Serialize)]
struct SlackMessage {
    attachments: Vec<SlackAttachment>,
}

#[derive(serde::Serialize)]
struct SlackAttachment {
    color: &'static str,
    text: String,
}

/// Posts colour-coded attachments to a Slack incoming webhook.
pub struct SlackWebhook {
    http: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhook {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Debug => "#808080",
        Severity::Info => "#36a64f",
        Severity::Warn => "#ff9500",
        Severity::Error => "#ff0000",
    }
}

/// Render the code-block body posted to Slack.
fn render_text(severity: Severity, message: &str, fields: &[(&str, String)]) -> String {
    let mut body = format!("```\nmailwarden {}: {message}\n", severity.label());
    for (key, value) in fields {
        body.push_str(&format!("{key}: {value}\n"));
    }
    body.push_str("```");
    body
}

#[async_trait]
impl NotificationSink for SlackWebhook {
    async fn post(
        &self,
        severity: Severity,
        message: &str,
        fields: &[(&str, String)],
    ) -> Result<(), NotifyError> {
        let payload = SlackMessage {
            attachments: vec![SlackAttachment {
                color: severity_color(severity),
                text: render_text(severity, message, fields),
            }],
        };
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}
