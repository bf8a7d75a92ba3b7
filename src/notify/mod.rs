// Operator alerts: deduplicated, with a pluggable delivery sink
pub mod discord;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::NotifySettings;

pub use discord::DiscordSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    /// Money at risk; always delivered
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
}

/// Delivery channel for alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log only
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            Severity::Info => tracing::info!(alert = %alert.message, "notify"),
            Severity::Warning => tracing::warn!(alert = %alert.message, "notify"),
            Severity::Critical => tracing::error!(alert = %alert.message, "notify"),
        }
        Ok(())
    }
}

/// Keeps delivered alerts in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.alerts().iter().filter(|a| a.severity == severity).count()
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .push(alert.clone());
        Ok(())
    }
}

/// Sends alerts through a sink, dropping repeats within the dedup window
///
/// Critical alerts bypass deduplication. Delivery failures are logged and
/// never propagate to the caller.
pub struct Notifier {
    sink: Box<dyn AlertSink>,
    prefix: String,
    window: Duration,
    history: Mutex<HashMap<(Severity, String), Instant>>,
}

impl Notifier {
    pub fn new(sink: Box<dyn AlertSink>, prefix: impl Into<String>, window: Duration) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Discord when a webhook is configured, otherwise log-only
    pub fn from_settings(settings: &NotifySettings) -> Self {
        let sink: Box<dyn AlertSink> = match settings.discord_webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Box::new(DiscordSink::new(url.to_string())),
            _ => Box::new(LogSink),
        };
        Self::new(
            sink,
            settings.prefix.clone(),
            Duration::from_secs(settings.dedup_window_secs),
        )
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.send(Severity::Info, message.into()).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.send(Severity::Warning, message.into()).await;
    }

    pub async fn critical(&self, message: impl Into<String>) {
        self.send(Severity::Critical, message.into()).await;
    }

    pub async fn send(&self, severity: Severity, message: String) {
        if severity != Severity::Critical && self.is_duplicate(severity, &message) {
            tracing::debug!(alert = %message, "duplicate alert suppressed");
            return;
        }

        let alert = Alert {
            severity,
            message: format!("{}{}", self.prefix, message),
        };
        if let Err(e) = self.sink.deliver(&alert).await {
            tracing::warn!(error = %e, alert = %alert.message, "alert delivery failed");
        }
    }

    /// Records the alert; true if the same one went out within the window
    fn is_duplicate(&self, severity: Severity, message: &str) -> bool {
        let now = Instant::now();
        let Ok(mut history) = self.history.lock() else {
            return false;
        };
        history.retain(|_, sent| now.duration_since(*sent) < self.window);

        let key = (severity, message.to_string());
        if history.contains_key(&key) {
            return true;
        }
        history.insert(key, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(window_secs: u64) -> (Notifier, MemorySink) {
        let sink = MemorySink::new();
        let notifier = Notifier::new(
            Box::new(sink.clone()),
            "[T] ",
            Duration::from_secs(window_secs),
        );
        (notifier, sink)
    }

    #[tokio::test]
    async fn test_duplicates_suppressed_within_window() {
        let (n, sink) = notifier(60);
        n.warning("TP placement failed").await;
        n.warning("TP placement failed").await;
        n.warning("something else").await;

        assert_eq!(sink.alerts().len(), 2);
        assert_eq!(sink.alerts()[0].message, "[T] TP placement failed");
    }

    #[tokio::test]
    async fn test_critical_bypasses_dedup() {
        let (n, sink) = notifier(60);
        n.critical("EMERGENCY CLOSE FAILED").await;
        n.critical("EMERGENCY CLOSE FAILED").await;

        assert_eq!(sink.count(Severity::Critical), 2);
    }

    #[tokio::test]
    async fn test_zero_window_never_dedups() {
        let (n, sink) = notifier(0);
        n.info("hello").await;
        n.info("hello").await;
        assert_eq!(sink.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_same_text_different_severity_not_deduped() {
        let (n, sink) = notifier(60);
        n.info("position closed").await;
        n.warning("position closed").await;
        assert_eq!(sink.alerts().len(), 2);
    }
}
