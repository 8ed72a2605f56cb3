use sea_orm::{DatabaseConnection, EntityTrait};
use std::env;
use std::path::PathBuf;

/// Process-level configuration from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root directory for per-owner file storage.
    pub storage_root: PathBuf,

    /// Directory where share hard-links/copies are materialized for
    /// static serving.
    pub public_dir: PathBuf,

    /// JWT secret key (required in production).
    pub jwt_secret: String,

    /// Email-gateway webhook endpoint; None disables outbound
    /// notifications entirely.
    pub notify_webhook_url: Option<String>,

    /// Sender identity stamped on notification emails.
    pub notify_from_email: String,
    pub notify_from_name: String,

    /// Base URL used when rendering share links in emails.
    pub base_url: String,

    /// Interval between expired-share sweeps, in seconds.
    pub sweep_interval_secs: u64,

    /// Allowed CORS origins (comma separated).
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data/storage"),
            public_dir: PathBuf::from("./data/public"),
            jwt_secret: "secret".to_string(),
            notify_webhook_url: None,
            notify_from_email: "noreply@sharevault.local".to_string(),
            notify_from_name: "ShareVault".to_string(),
            base_url: "http://localhost:3000".to_string(),
            sweep_interval_secs: 300,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.storage_root),

            public_dir: env::var("PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.public_dir),

            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "secret".to_string()),

            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),

            notify_from_email: env::var("NOTIFY_FROM_EMAIL").unwrap_or(default.notify_from_email),

            notify_from_name: env::var("NOTIFY_FROM_NAME").unwrap_or(default.notify_from_name),

            base_url: env::var("BASE_URL").unwrap_or(default.base_url),

            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.sweep_interval_secs),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }
}

/// Admin-controlled policy knobs, persisted in the `config_entries` table
/// and read once at startup into named, typed fields. No string-keyed
/// cast-by-type lookups anywhere past this point.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    /// Upload ceiling in bytes.
    pub max_file_size_bytes: i64,

    /// Default share lifetime in days when the creator does not pick one.
    pub default_max_share_days: i64,

    /// Default download cap for new shares; None = unlimited.
    pub default_max_downloads: Option<i32>,

    /// Extension allow-list; `["*"]` means everything outside the hard
    /// deny-list.
    pub allowed_extensions: Vec<String>,

    /// Chunk size for streamed delivery.
    pub stream_chunk_size: usize,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 512 * 1024 * 1024, // 512 MB
            default_max_share_days: 30,
            default_max_downloads: None,
            allowed_extensions: vec!["*".to_string()],
            stream_chunk_size: 8 * 1024,
        }
    }
}

impl PolicySettings {
    /// Loads policy rows from the config table, falling back field by
    /// field to the defaults for anything missing or unparsable.
    pub async fn load(db: &DatabaseConnection) -> Result<Self, sea_orm::DbErr> {
        use crate::entities::prelude::ConfigEntries;

        let rows = ConfigEntries::find().all(db).await?;

        let mut settings = Self::default();
        for row in rows {
            match row.key.as_str() {
                "max_file_size" => {
                    if let Ok(v) = row.value.parse() {
                        settings.max_file_size_bytes = v;
                    }
                }
                "default_max_share_days" => {
                    if let Ok(v) = row.value.parse() {
                        settings.default_max_share_days = v;
                    }
                }
                "default_max_downloads" => {
                    // Empty value = unlimited.
                    settings.default_max_downloads = row.value.parse().ok();
                }
                "allowed_extensions" => {
                    let list: Vec<String> = row
                        .value
                        .split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if !list.is_empty() {
                        settings.allowed_extensions = list;
                    }
                }
                _ => {}
            }
        }

        Ok(settings)
    }
}
