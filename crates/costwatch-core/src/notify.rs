//! Alert delivery.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::SinkError;
use crate::usage::UsageSnapshot;

/// Default client-side timeout for one delivery
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination for threshold alerts
pub trait NotificationSink: Send + Sync {
    /// Deliver one alert. Any non-success outcome is an error.
    fn deliver(&self, text: &str) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Posts `{"text": ...}` to a webhook URL (Slack-compatible)
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_SINK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl NotificationSink for WebhookSink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        let url = self.url.clone();
        let timeout = self.timeout;
        let payload = serde_json::json!({ "text": text });

        // ureq is blocking; keep it off the runtime threads
        tokio::task::spawn_blocking(move || {
            let config = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .build();
            let agent = ureq::Agent::new_with_config(config);
            match agent.post(url.as_str()).send_json(&payload) {
                Ok(response) => {
                    debug!(status = response.status().as_u16(), "Webhook accepted alert");
                    Ok(())
                }
                Err(ureq::Error::StatusCode(code)) => Err(SinkError::Status { code }),
                Err(err) => Err(SinkError::Transport(err.to_string())),
            }
        })
        .await
        .map_err(|err| SinkError::Join(err.to_string()))?
    }
}

/// One-line alert text for a breach
pub fn format_alert(snapshot: &UsageSnapshot, threshold: f64) -> String {
    let mut text = format!(
        "Usage alert: ${:.2} spent in {}, over the ${:.2} threshold",
        snapshot.total_cost, snapshot.period, threshold
    );
    if !snapshot.models_used.is_empty() {
        text.push_str(&format!(" (models: {})", snapshot.models_used.join(", ")));
    }
    text
}
