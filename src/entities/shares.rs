use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shares")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// High-entropy hex bearer capability. Globally unique.
    #[sea_orm(unique)]
    pub token: String,
    pub file_id: String,
    pub created_by: String,
    pub password_hash: Option<String>,
    /// NULL = unlimited downloads.
    pub max_downloads: Option<i32>,
    /// NULL = never expires.
    pub expires_at: Option<DateTimeUtc>,
    pub is_active: bool,
    /// Monotonically increasing; bumped before streaming starts.
    pub download_count: i32,
    pub last_accessed: Option<DateTimeUtc>,
    pub recipient_email: Option<String>,
    pub recipient_message: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::files::Entity",
        from = "Column::FileId",
        to = "super::files::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    File,
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::CreatedBy",
        to = "super::users::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Creator,
    #[sea_orm(has_many = "super::download_logs::Entity")]
    DownloadLogs,
}

impl Related<super::files::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Creator.def()
    }
}

impl Related<super::download_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DownloadLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
