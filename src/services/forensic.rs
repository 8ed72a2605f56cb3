use crate::entities::{audit_logs, download_logs, security_events};
use crate::utils::user_agent::parse_user_agent;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Request-scoped client metadata threaded into forensic rows.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Append-only audit sinks. Every method is best-effort: a failing write
/// is logged to the process log and swallowed, never surfaced to the
/// operation being audited.
#[derive(Clone)]
pub struct ForensicService {
    db: DatabaseConnection,
}

impl ForensicService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Fire-and-forget security signal (traversal attempt, dangerous
    /// upload, rate-limit breach, ...).
    pub fn log_security_event(
        &self,
        action: &str,
        severity: Severity,
        meta: &RequestMeta,
        user_id: Option<String>,
        description: String,
        metadata: Option<Value>,
    ) {
        info!(
            target: "audit",
            action = %action,
            severity = %severity.as_str(),
            ip = ?meta.ip,
            user_id = ?user_id,
            "Security event"
        );

        let db = self.db.clone();
        let row = security_events::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            action: Set(action.to_string()),
            severity: Set(severity.as_str().to_string()),
            ip_address: Set(meta.ip.clone()),
            user_agent: Set(meta.user_agent.clone()),
            user_id: Set(user_id),
            description: Set(description),
            metadata: Set(metadata.map(|v| v.to_string())),
            created_at: Set(Utc::now()),
        };

        tokio::spawn(async move {
            if let Err(e) = row.insert(&db).await {
                error!("Failed to persist security event: {}", e);
            }
        });
    }

    /// Opens a download-log row for an attempt that passed the access
    /// gate and returns its correlation id. Synchronous because callers
    /// need the id, but a failed insert degrades to None instead of
    /// failing the download.
    pub async fn log_download(
        &self,
        file_id: &str,
        share_id: Option<&str>,
        user_id: Option<&str>,
        meta: &RequestMeta,
    ) -> Option<String> {
        let client = meta.user_agent.as_deref().map(parse_user_agent);

        let row = download_logs::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            file_id: Set(file_id.to_string()),
            share_id: Set(share_id.map(|s| s.to_string())),
            user_id: Set(user_id.map(|s| s.to_string())),
            ip_address: Set(meta.ip.clone()),
            user_agent: Set(meta.user_agent.clone()),
            browser: Set(client.as_ref().and_then(|c| c.browser.clone())),
            os: Set(client.as_ref().and_then(|c| c.os.clone())),
            device: Set(client.as_ref().map(|c| c.device.clone())),
            bot: Set(client.as_ref().and_then(|c| c.bot.clone())),
            referer: Set(meta.referer.clone()),
            language: Set(meta.language.clone()),
            bytes_sent: Set(0),
            http_status: Set(None),
            started_at: Set(Utc::now()),
            completed_at: Set(None),
        };

        match row.insert(&self.db).await {
            Ok(model) => Some(model.id),
            Err(e) => {
                error!("Failed to open download log: {}", e);
                None
            }
        }
    }

    /// Stamps a download-log row with the final byte count and status.
    /// Best-effort, callable from a stream-drop guard.
    pub fn complete_download(&self, correlation_id: String, bytes_sent: i64, http_status: i32) {
        let db = self.db.clone();
        tokio::spawn(async move {
            let update = download_logs::ActiveModel {
                id: Set(correlation_id.clone()),
                bytes_sent: Set(bytes_sent),
                http_status: Set(Some(http_status)),
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            };
            if let Err(e) = update.update(&db).await {
                warn!("Failed to complete download log {}: {}", correlation_id, e);
            }
        });
    }

    /// Coarse activity audit, mirrored to tracing before the insert.
    pub fn log_event(
        &self,
        actor_id: Option<String>,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        description: String,
        metadata: Option<Value>,
    ) {
        info!(
            target: "audit",
            actor = ?actor_id,
            action = %action,
            entity = %format!("{}:{}", entity_type, entity_id),
            "{}", description
        );

        let db = self.db.clone();
        let row = audit_logs::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            actor_id: Set(actor_id),
            action: Set(action.to_string()),
            entity_type: Set(entity_type.to_string()),
            entity_id: Set(entity_id.to_string()),
            description: Set(description),
            metadata: Set(metadata.map(|v| v.to_string())),
            created_at: Set(Utc::now()),
        };

        tokio::spawn(async move {
            if let Err(e) = row.insert(&db).await {
                error!("Failed to persist audit log: {}", e);
            }
        });
    }
}
