use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Sender identity attached to an outbound message.
#[derive(Debug, Clone)]
pub struct NotifyOptions {
    pub from_email: String,
    pub from_name: String,
}

/// Outbound notification seam. Implementations return a plain bool; a
/// thrown transport error and a false return are the same thing to
/// callers, and no caller is allowed to block or fail on the result.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str, opts: &NotifyOptions) -> bool;
}

/// Posts messages as JSON to an email-gateway webhook. SMTP itself lives
/// on the far side of that endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, to: &str, subject: &str, html_body: &str, opts: &NotifyOptions) -> bool {
        let payload = json!({
            "to": to,
            "subject": subject,
            "html": html_body,
            "from_email": opts.from_email,
            "from_name": opts.from_name,
        });

        match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!("Notification gateway returned {}", resp.status());
                false
            }
            Err(e) => {
                tracing::warn!("Notification send failed: {}", e);
                false
            }
        }
    }
}

/// Drops every message. Used when no gateway is configured, and in tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, to: &str, _subject: &str, _html_body: &str, _opts: &NotifyOptions) -> bool {
        tracing::debug!("Notification to {} dropped (no gateway configured)", to);
        false
    }
}

/// Picks the notifier implied by configuration.
pub fn build_notifier(webhook_url: Option<&str>) -> Arc<dyn Notifier> {
    match webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.to_string())),
        None => Arc::new(NoopNotifier),
    }
}
