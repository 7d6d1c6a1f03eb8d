//! Notification transports
//!
//! A notifier is best-effort: the alert manager logs and counts failures but
//! never hands them back to an incident lifecycle.

use crate::alerts::Alert;
use crate::error::AlertError;
use log::{info, warn};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>>;

pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, alert: &'a Alert) -> NotifyFuture<'a>;

    fn name(&self) -> &str;
}

/// Writes every alert to the log; attention-worthy ones at `warn`
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            if alert.needs_attention() {
                warn!("ATTENTION: {}", alert.summary());
            } else {
                info!("{}", alert.summary());
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Posts each alert as JSON to a webhook
///
/// The body carries a chat-friendly `text` line next to the full alert.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify<'a>(&'a self, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            let body = json!({
                "text": truncate_text(&alert.summary(), 1024),
                "severity": alert.severity(),
                "needs_attention": alert.needs_attention(),
                "alert": alert,
            });

            let response = self.client.post(&self.url).json(&body).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(AlertError::NotificationFailed(format!(
                    "webhook {} returned {}",
                    self.url, status
                )));
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

pub const SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";

/// Slack rejects longer messages; keep well under the limit
const SLACK_MAX_TEXT: usize = 3000;

/// Posts each alert to a Slack channel through `chat.postMessage`
pub struct SlackNotifier {
    client: Client,
    token: String,
    channel: String,
    api_url: String,
}

impl SlackNotifier {
    pub fn new(
        token: impl Into<String>,
        channel: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token: token.into(),
            channel: channel.into(),
            api_url: SLACK_API_URL.to_string(),
        })
    }

    /// Point at a different API endpoint
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Request body for `chat.postMessage`
pub fn slack_payload(channel: &str, alert: &Alert) -> Value {
    let icon = if alert.needs_attention() {
        ":rotating_light:"
    } else {
        ":information_source:"
    };
    json!({
        "channel": channel,
        "text": truncate_text(&format!("{} {}", icon, alert.summary()), SLACK_MAX_TEXT),
        "username": "OpsBot",
        "icon_emoji": ":robot_face:",
    })
}

/// Slack answers HTTP 200 with `"ok": false` for most failures
pub fn check_slack_response(status: StatusCode, body: &Value) -> Result<(), AlertError> {
    if !status.is_success() {
        return Err(AlertError::NotificationFailed(format!(
            "slack returned {}",
            status
        )));
    }
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    let reason = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(AlertError::NotificationFailed(format!(
        "slack rejected message: {}",
        reason
    )))
}

impl Notifier for SlackNotifier {
    fn notify<'a>(&'a self, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.api_url)
                .bearer_auth(&self.token)
                .json(&slack_payload(&self.channel, alert))
                .send()
                .await?;
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            check_slack_response(status, &body)
        })
    }

    fn name(&self) -> &str {
        "slack"
    }
}

/// Truncate to at most `max_length` bytes on a character boundary, marking
/// the cut with `...`
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    let mut cut = max_length.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// Records delivered alerts; can be switched to fail
#[derive(Debug, Clone, Default)]
pub struct MockNotifier {
    delivered: Arc<Mutex<Vec<Alert>>>,
    failing: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.set_failing(true);
        notifier
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Alert> {
        lock(&self.delivered).clone()
    }
}

impl Notifier for MockNotifier {
    fn notify<'a>(&'a self, alert: &'a Alert) -> NotifyFuture<'a> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AlertError::NotificationFailed(
                    "mock notifier failure".to_string(),
                ));
            }
            lock(&self.delivered).push(alert.clone());
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
