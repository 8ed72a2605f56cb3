use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only security signal (traversal attempt, dangerous upload,
/// rate-limit breach). Also the backing store for the IP rate limiter.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "security_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub action: String,
    /// "low", "medium", "high" or "critical".
    pub severity: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub description: String,
    /// Free-form JSON payload.
    pub metadata: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
