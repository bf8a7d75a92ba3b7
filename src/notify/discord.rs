use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::{Alert, AlertSink, Severity};

/// Discord webhook delivery
pub struct DiscordSink {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordSink {
    pub fn new(webhook_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
        }
    }

    fn content(alert: &Alert) -> String {
        match alert.severity {
            Severity::Info => alert.message.clone(),
            Severity::Warning => format!("⚠️ {}", alert.message),
            Severity::Critical => format!("@here 🚨 {}", alert.message),
        }
    }
}

#[async_trait]
impl AlertSink for DiscordSink {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "content": Self::content(alert) }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Discord webhook returned {}", response.status());
        }
        Ok(())
    }
}
