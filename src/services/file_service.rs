use crate::api::error::AppError;
use crate::config::PolicySettings;
use crate::entities::{files, prelude::*, shares};
use crate::services::forensic::{ForensicService, RequestMeta, Severity};
use crate::services::quota::QuotaService;
use crate::services::storage::StorageService;
use crate::utils::hash::ContentHasher;
use crate::utils::validation::{
    validate_file_extension, validate_filename, DENIED_MIME_TYPES, EXPECTED_MIME_TYPES,
};
use async_recursion::async_recursion;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Upload input admission: either a real multipart stream, or a local
/// file explicitly flagged as such by a test/CLI harness. Nothing else
/// enters the pipeline.
pub enum UploadSource<'a> {
    Stream {
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        declared_name: String,
    },
    LocalFile {
        path: PathBuf,
        declared_name: String,
    },
}

/// Typed rejection reasons. These are answers, not errors: the pipeline
/// returns them to the uploader and never raises for expected bad input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRejection {
    InvalidFilename,
    TooLarge { limit: i64 },
    QuotaExceeded,
    ExtensionNotAllowed { extension: String },
    MimeMismatch { extension: String, detected: String },
    DangerousType { detected: String },
    Duplicate { existing_id: String },
}

impl UploadRejection {
    pub fn code(&self) -> &'static str {
        match self {
            UploadRejection::InvalidFilename => "INVALID_FILENAME",
            UploadRejection::TooLarge { .. } => "FILE_TOO_LARGE",
            UploadRejection::QuotaExceeded => "QUOTA_EXCEEDED",
            UploadRejection::ExtensionNotAllowed { .. } => "EXTENSION_NOT_ALLOWED",
            UploadRejection::MimeMismatch { .. } => "MIME_MISMATCH",
            UploadRejection::DangerousType { .. } => "DANGEROUS_TYPE",
            UploadRejection::Duplicate { .. } => "DUPLICATE",
        }
    }

    pub fn message(&self) -> String {
        match self {
            UploadRejection::InvalidFilename => "The file name is not acceptable".to_string(),
            UploadRejection::TooLarge { limit } => {
                format!("File exceeds the maximum size of {} bytes", limit)
            }
            UploadRejection::QuotaExceeded => "Not enough storage space available".to_string(),
            UploadRejection::ExtensionNotAllowed { extension } => {
                format!("Files of type '.{}' are not allowed", extension)
            }
            // Deliberately vague: no detail about why content was flagged.
            UploadRejection::MimeMismatch { .. } | UploadRejection::DangerousType { .. } => {
                "This file type is not allowed".to_string()
            }
            UploadRejection::Duplicate { existing_id } => {
                format!("An identical file already exists (id {})", existing_id)
            }
        }
    }
}

pub enum UploadOutcome {
    Accepted(files::Model),
    Rejected(UploadRejection),
}

pub enum StageOutcome {
    Staged(StagedUpload),
    Rejected(UploadRejection),
}

/// A validated-so-far upload sitting in the staging directory.
pub struct StagedUpload {
    pub temp_path: PathBuf,
    pub declared_name: String,
    pub size: i64,
    pub content_hash: String,
    pub detected_mime: String,
}

/// Metadata for the finalize step. `file_id` is caller-generated so the
/// two-phase pipeline stays deterministic for its tests.
pub struct UploadMeta {
    pub file_id: String,
    pub owner_id: String,
    pub parent_id: Option<String>,
    pub description: Option<String>,
    pub allow_duplicates: bool,
    pub request: RequestMeta,
}

pub struct FileService {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    forensic: ForensicService,
    policy: PolicySettings,
}

impl FileService {
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn StorageService>,
        forensic: ForensicService,
        policy: PolicySettings,
    ) -> Self {
        Self {
            db,
            storage,
            forensic,
            policy,
        }
    }

    /// One-shot upload: stage, then finalize under a fresh id.
    pub async fn upload(
        &self,
        source: UploadSource<'_>,
        owner_id: String,
        parent_id: Option<String>,
        description: Option<String>,
        allow_duplicates: bool,
        request: RequestMeta,
    ) -> Result<UploadOutcome, AppError> {
        let staged = match self.stage(source, &request).await? {
            StageOutcome::Staged(s) => s,
            StageOutcome::Rejected(r) => return Ok(UploadOutcome::Rejected(r)),
        };

        self.finalize(
            staged,
            UploadMeta {
                file_id: Uuid::new_v4().to_string(),
                owner_id,
                parent_id,
                description,
                allow_duplicates,
                request,
            },
        )
        .await
    }

    /// Phase one: admission, filename check, stream to the staging area
    /// while hashing and counting, sniff the real MIME type from content.
    /// The client-declared content type is never consulted.
    pub async fn stage(
        &self,
        source: UploadSource<'_>,
        request: &RequestMeta,
    ) -> Result<StageOutcome, AppError> {
        let (mut reader, declared_name) = match source {
            UploadSource::Stream {
                reader,
                declared_name,
            } => (reader, declared_name),
            UploadSource::LocalFile {
                path,
                declared_name,
            } => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| AppError::Internal(format!("opening local source: {}", e)))?;
                (
                    Box::new(file) as Box<dyn AsyncRead + Unpin + Send>,
                    declared_name,
                )
            }
        };

        if !validate_filename(&declared_name) {
            self.forensic.log_security_event(
                "invalid_filename",
                Severity::Medium,
                request,
                None,
                format!("Rejected upload with invalid filename: {:?}", declared_name),
                None,
            );
            return Ok(StageOutcome::Rejected(UploadRejection::InvalidFilename));
        }

        let temp_path = self
            .storage
            .staging_dir()
            .join(format!("upl-{}", Uuid::new_v4()));
        let mut out = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| AppError::Internal(format!("creating staging file: {}", e)))?;

        let max = self.policy.max_file_size_bytes;
        let mut hasher = ContentHasher::new();
        let mut header: Vec<u8> = Vec::with_capacity(8192);
        let mut size: i64 = 0;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| AppError::Internal(format!("reading upload: {}", e)))?;
            if n == 0 {
                break;
            }
            size += n as i64;
            if size > max {
                drop(out);
                let _ = tokio::fs::remove_file(&temp_path).await;
                self.forensic.log_security_event(
                    "oversized_upload",
                    Severity::Low,
                    request,
                    None,
                    format!("Upload of {:?} exceeded the {} byte limit", declared_name, max),
                    None,
                );
                return Ok(StageOutcome::Rejected(UploadRejection::TooLarge {
                    limit: max,
                }));
            }

            if header.len() < 8192 {
                let want = (8192 - header.len()).min(n);
                header.extend_from_slice(&buf[..want]);
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .await
                .map_err(|e| AppError::Internal(format!("writing staging file: {}", e)))?;
        }

        out.flush()
            .await
            .map_err(|e| AppError::Internal(format!("flushing staging file: {}", e)))?;

        let detected_mime = sniff_mime(&header);

        Ok(StageOutcome::Staged(StagedUpload {
            temp_path,
            declared_name,
            size,
            content_hash: hasher.finalize(),
            detected_mime,
        }))
    }

    /// Phase two: quota, extension policy, content/extension
    /// cross-validation, dedup, atomic placement, then record + quota +
    /// audit as one logical unit. If the insert fails after the move,
    /// the placed file is deleted before the error is re-raised.
    pub async fn finalize(
        &self,
        staged: StagedUpload,
        meta: UploadMeta,
    ) -> Result<UploadOutcome, AppError> {
        match self.run_finalize_checks(&staged, &meta).await {
            Ok(None) => {}
            Ok(Some(rejection)) => {
                let _ = tokio::fs::remove_file(&staged.temp_path).await;
                return Ok(UploadOutcome::Rejected(rejection));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged.temp_path).await;
                return Err(e);
            }
        }

        // Placement: collision-resistant stored name, move into the
        // per-owner directory.
        let extension = extension_of(&staged.declared_name);
        let stored_name = match extension.as_deref() {
            Some(ext) => format!("{}.{}", Uuid::new_v4().simple(), ext),
            None => Uuid::new_v4().simple().to_string(),
        };

        let relative_path = self
            .storage
            .place(&staged.temp_path, &meta.owner_id, &stored_name)
            .await
            .map_err(|e| AppError::Internal(format!("placing upload: {}", e)))?;

        let row = files::ActiveModel {
            id: Set(meta.file_id.clone()),
            user_id: Set(Some(meta.owner_id.clone())),
            parent_id: Set(meta.parent_id.clone()),
            is_folder: Set(false),
            filename: Set(staged.declared_name.clone()),
            stored_name: Set(Some(stored_name)),
            storage_path: Set(Some(relative_path.clone())),
            size: Set(staged.size),
            mime_type: Set(Some(staged.detected_mime.clone())),
            content_hash: Set(Some(staged.content_hash.clone())),
            description: Set(meta.description.clone()),
            is_shared: Set(false),
            is_expired: Set(false),
            expired_at: Set(None),
            never_expire: Set(false),
            created_at: Set(Utc::now()),
        };

        let model = match row.insert(&self.db).await {
            Ok(model) => model,
            Err(e) => {
                // No orphaned bytes: the record failed, the file goes.
                if let Err(rm) = self.storage.remove(&relative_path).await {
                    tracing::error!(
                        "Failed to clean up {} after insert failure: {}",
                        relative_path,
                        rm
                    );
                }
                return Err(AppError::Database(e));
            }
        };

        QuotaService::update_storage_used(&self.db, &meta.owner_id, staged.size).await?;

        self.forensic.log_event(
            Some(meta.owner_id.clone()),
            "file_upload",
            "file",
            &model.id,
            format!("Uploaded {:?} ({} bytes)", model.filename, model.size),
            Some(json!({
                "mime_type": staged.detected_mime,
                "hash": staged.content_hash,
            })),
        );

        Ok(UploadOutcome::Accepted(model))
    }

    /// Quota, extension, cross-check and dedup gates, in order. Returns
    /// a rejection, or None when the upload may proceed to placement.
    async fn run_finalize_checks(
        &self,
        staged: &StagedUpload,
        meta: &UploadMeta,
    ) -> Result<Option<UploadRejection>, AppError> {
        if !QuotaService::has_storage_available(&self.db, &meta.owner_id, staged.size).await? {
            return Ok(Some(UploadRejection::QuotaExceeded));
        }

        let extension = extension_of(&staged.declared_name).unwrap_or_default();
        if !validate_file_extension(&staged.declared_name, &self.policy.allowed_extensions) {
            self.forensic.log_security_event(
                "blocked_extension",
                Severity::Medium,
                &meta.request,
                Some(meta.owner_id.clone()),
                format!("Blocked upload with extension '.{}'", extension),
                Some(json!({ "filename": staged.declared_name })),
            );
            return Ok(Some(UploadRejection::ExtensionNotAllowed { extension }));
        }

        if let Some(rejection) = cross_check_content(&extension, &staged.detected_mime) {
            self.forensic.log_security_event(
                "dangerous_upload",
                Severity::High,
                &meta.request,
                Some(meta.owner_id.clone()),
                format!(
                    "Content check failed for {:?}: detected '{}'",
                    staged.declared_name, staged.detected_mime
                ),
                None,
            );
            return Ok(Some(rejection));
        }

        if let Some(parent_id) = &meta.parent_id {
            let parent = Files::find_by_id(parent_id)
                .one(&self.db)
                .await?
                .ok_or_else(|| AppError::NotFound("Parent folder not found".to_string()))?;
            if !parent.is_folder {
                return Err(AppError::BadRequest(
                    "Parent must be a folder".to_string(),
                ));
            }
        }

        if !meta.allow_duplicates {
            let mut query = Files::find()
                .filter(files::Column::ContentHash.eq(&staged.content_hash))
                .filter(files::Column::IsFolder.eq(false))
                .filter(files::Column::IsExpired.eq(false));
            query = match &meta.parent_id {
                Some(parent_id) => query.filter(files::Column::ParentId.eq(parent_id)),
                None => query.filter(files::Column::ParentId.is_null()),
            };
            let existing = query.one(&self.db).await?;
            if let Some(existing) = existing {
                return Ok(Some(UploadRejection::Duplicate {
                    existing_id: existing.id,
                }));
            }
        }

        Ok(None)
    }

    /// Inserts a zero-size, path-less folder row.
    pub async fn create_folder(
        &self,
        owner_id: String,
        name: String,
        parent_id: Option<String>,
    ) -> Result<files::Model, AppError> {
        if !validate_filename(&name) {
            return Err(AppError::BadRequest("Invalid folder name".to_string()));
        }

        if let Some(parent_id) = &parent_id {
            let parent = Files::find_by_id(parent_id)
                .filter(files::Column::UserId.eq(&owner_id))
                .one(&self.db)
                .await?
                .ok_or_else(|| AppError::NotFound("Parent folder not found".to_string()))?;
            if !parent.is_folder {
                return Err(AppError::BadRequest(
                    "Parent must be a folder".to_string(),
                ));
            }
        }

        let row = files::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            user_id: Set(Some(owner_id)),
            parent_id: Set(parent_id),
            is_folder: Set(true),
            filename: Set(name),
            stored_name: Set(None),
            storage_path: Set(None),
            size: Set(0),
            mime_type: Set(None),
            content_hash: Set(None),
            description: Set(None),
            is_shared: Set(false),
            is_expired: Set(false),
            expired_at: Set(None),
            never_expire: Set(false),
            created_at: Set(Utc::now()),
        };

        Ok(row.insert(&self.db).await?)
    }

    /// Deletes a file or folder. Folders cascade post-order: every
    /// descendant file is unlinked and removed before its parent row
    /// goes, so an interruption never leaves children of a deleted
    /// folder behind.
    pub async fn delete_item(
        &self,
        file_id: &str,
        acting_user_id: &str,
        acting_is_admin: bool,
    ) -> Result<u64, AppError> {
        let item = Files::find_by_id(file_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        if !acting_is_admin && item.user_id.as_deref() != Some(acting_user_id) {
            return Err(AppError::Forbidden("Not the owner".to_string()));
        }

        let deleted = self.delete_recursive(&item).await?;

        self.forensic.log_event(
            Some(acting_user_id.to_string()),
            "file_delete",
            if item.is_folder { "folder" } else { "file" },
            &item.id,
            format!("Deleted {:?} ({} rows)", item.filename, deleted),
            None,
        );

        Ok(deleted)
    }

    #[async_recursion]
    async fn delete_recursive(&self, item: &files::Model) -> Result<u64, AppError> {
        let mut deleted = 0u64;

        if item.is_folder {
            let children = Files::find()
                .filter(files::Column::ParentId.eq(&item.id))
                .all(&self.db)
                .await?;
            for child in &children {
                deleted += self.delete_recursive(child).await?;
            }
        }

        // Revoke shares and their public copies before the row goes.
        let share_rows = Shares::find()
            .filter(shares::Column::FileId.eq(&item.id))
            .all(&self.db)
            .await?;
        for share in &share_rows {
            if let Err(e) = self.storage.remove_public(&share.token).await {
                tracing::warn!("Failed to remove public copy {}: {}", share.token, e);
            }
        }
        Shares::delete_many()
            .filter(shares::Column::FileId.eq(&item.id))
            .exec(&self.db)
            .await?;

        if !item.is_folder {
            if let Some(path) = &item.storage_path {
                if let Err(e) = self.storage.remove(path).await {
                    tracing::warn!("Failed to unlink {}: {}", path, e);
                }
            }
            if let Some(owner) = &item.user_id {
                QuotaService::update_storage_used(&self.db, owner, -item.size).await?;
            }
        }

        Files::delete_by_id(&item.id).exec(&self.db).await?;
        deleted += 1;
        Ok(deleted)
    }

    /// Administrative ownership transfer. All-or-nothing: quota headroom
    /// is verified and both ledgers plus the file row move in one
    /// transaction, attributed to the explicit acting actor.
    pub async fn reassign_owner(
        &self,
        file_id: &str,
        new_owner_id: &str,
        acting_user_id: &str,
    ) -> Result<files::Model, AppError> {
        let file_id = file_id.to_string();
        let new_owner = new_owner_id.to_string();

        let updated = self
            .db
            .transaction::<_, files::Model, AppError>(|txn| {
                let file_id = file_id.clone();
                let new_owner = new_owner.clone();
                Box::pin(async move {
                    let file = Files::find_by_id(&file_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

                    if !QuotaService::has_storage_available(txn, &new_owner, file.size).await? {
                        return Err(AppError::BadRequest(
                            "Target user does not have enough free storage".to_string(),
                        ));
                    }

                    QuotaService::transfer(txn, file.user_id.as_deref(), &new_owner, file.size)
                        .await?;

                    let mut active: files::ActiveModel = file.into();
                    active.user_id = Set(Some(new_owner));
                    Ok(active.update(txn).await?)
                })
            })
            .await
            .map_err(|e| match e {
                sea_orm::TransactionError::Connection(e) => AppError::Database(e),
                sea_orm::TransactionError::Transaction(e) => e,
            })?;

        self.forensic.log_event(
            Some(acting_user_id.to_string()),
            "owner_reassign",
            "file",
            &updated.id,
            format!(
                "Reassigned {:?} to user {}",
                updated.filename,
                updated.user_id.as_deref().unwrap_or("?")
            ),
            None,
        );

        Ok(updated)
    }
}

/// Content-derived MIME type; the client-declared one is ignored.
fn sniff_mime(header: &[u8]) -> String {
    if header.starts_with(b"#!") {
        // Shebang: infer has no signature for scripts.
        return "text/x-shellscript".to_string();
    }
    infer::get(header)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Dangerous-MIME deny-list plus the static extension/MIME expectation
/// map. A sniffed type outside the expectation for its extension is
/// treated as tampering.
fn cross_check_content(extension: &str, detected_mime: &str) -> Option<UploadRejection> {
    if DENIED_MIME_TYPES.contains(&detected_mime) || detected_mime == "text/x-shellscript" {
        return Some(UploadRejection::DangerousType {
            detected: detected_mime.to_string(),
        });
    }

    if let Some((_, expected)) = EXPECTED_MIME_TYPES.iter().find(|(ext, _)| *ext == extension) {
        // Sniffing can come up empty for container formats; only a
        // positive detection that contradicts the extension rejects.
        if detected_mime != "application/octet-stream" && !expected.contains(&detected_mime) {
            return Some(UploadRejection::MimeMismatch {
                extension: extension.to_string(),
                detected: detected_mime.to_string(),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]), "image/png");
        assert_eq!(sniff_mime(b"#!/bin/sh\necho hi"), "text/x-shellscript");
        assert_eq!(sniff_mime(b"just some text"), "application/octet-stream");
    }

    #[test]
    fn test_cross_check_content() {
        assert!(cross_check_content("png", "image/png").is_none());
        assert!(cross_check_content("png", "application/octet-stream").is_none());
        // Unknown extensions are not cross-checked.
        assert!(cross_check_content("xyz", "image/png").is_none());

        assert!(matches!(
            cross_check_content("png", "application/pdf"),
            Some(UploadRejection::MimeMismatch { .. })
        ));
        assert!(matches!(
            cross_check_content("jpg", "text/x-shellscript"),
            Some(UploadRejection::DangerousType { .. })
        ));
        assert!(matches!(
            cross_check_content("pdf", "application/x-dosexec"),
            Some(UploadRejection::DangerousType { .. })
        ));
    }

    #[test]
    fn test_rejection_messages_leak_nothing_dangerous() {
        let msg = UploadRejection::DangerousType {
            detected: "application/x-php".to_string(),
        }
        .message();
        assert!(!msg.contains("php"));
    }
}
