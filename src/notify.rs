//! One-way publication of status messages.
//!
//! Publishing is fire-and-forget: a sink that fails logs the failure and the
//! caller carries on. Messages are markdown-flavoured plain text.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::NotifyConfig;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, message: &str);
}

/// Writes messages to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, message: &str) {
        tracing::info!(target: "vk::notify", "\n{}", message);
    }
}

/// POSTs `{"text": message}` to a webhook (Mattermost/Slack incoming hook
/// shape).
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn post(&self, message: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await
            .context("webhook request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, message: &str) {
        if let Err(e) = self.post(message).await {
            tracing::warn!(url = %self.url, error = format!("{:#}", e), "notification not delivered");
        }
    }
}

/// Keeps every published message in memory.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, message: &str) {
        let mut messages = self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        messages.push(message.to_string());
    }
}

pub fn create_notifier(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match config.backend.as_str() {
        "log" => Ok(Arc::new(LogNotifier)),
        "webhook" => {
            let url = config
                .webhook_url
                .as_deref()
                .context("notify.webhook_url must be set when notify.backend = 'webhook'")?;
            Ok(Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        other => anyhow::bail!("Unknown notify backend: '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_notifier_keeps_order() {
        let n = RecordingNotifier::new();
        n.publish("one").await;
        n.clone().publish("two").await;
        assert_eq!(n.messages(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_fail() {
        let n = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        n.publish("hello").await;
    }

    #[test]
    fn test_create_notifier_requires_url() {
        let config = NotifyConfig {
            backend: "webhook".into(),
            webhook_url: None,
            timeout_secs: 1,
        };
        assert!(create_notifier(&config).is_err());
    }
}
