use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Polymorphic file/folder row. Folders carry no content attributes:
/// size is 0 and stored_name/storage_path/content_hash stay NULL.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// NULL when the owning user was deleted (orphan, awaiting reassignment).
    pub user_id: Option<String>,
    /// NULL means the item sits at the root of its owner's tree.
    pub parent_id: Option<String>,
    pub is_folder: bool,
    /// Original display name as uploaded.
    pub filename: String,
    /// System-generated on-disk name, collision resistant.
    pub stored_name: Option<String>,
    /// Path relative to the storage root.
    pub storage_path: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub content_hash: Option<String>,
    pub description: Option<String>,
    /// Rollup flag: true while at least one active share references this row.
    pub is_shared: bool,
    pub is_expired: bool,
    pub expired_at: Option<DateTimeUtc>,
    pub never_expire: bool,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    Owner,
    #[sea_orm(has_many = "super::shares::Entity")]
    Shares,
    #[sea_orm(has_many = "super::download_logs::Entity")]
    DownloadLogs,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Owner.def()
    }
}

impl Related<super::shares::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Shares.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
