use crate::api::error::AppError;
use crate::config::PolicySettings;
use crate::entities::{files, prelude::*, shares};
use crate::services::forensic::{ForensicService, RequestMeta, Severity};
use crate::services::notify::{Notifier, NotifyOptions};
use crate::services::storage::StorageService;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use async_recursion::async_recursion;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use rand::RngCore;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

/// Access state for a share token, evaluated fresh on every request.
/// The first failing state in declaration order wins, so an expired
/// password-protected share reports Expired, not PasswordRequired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareAccess {
    NotFound,
    Revoked,
    Expired,
    Exhausted,
    PasswordRequired,
    Valid,
}

/// Pure gate over a loaded share row. No clock reads, no IO: `now` and
/// the candidate password come in from the caller.
pub fn evaluate_access(
    share: Option<&shares::Model>,
    now: DateTime<Utc>,
    password: Option<&str>,
) -> ShareAccess {
    let share = match share {
        Some(s) => s,
        None => return ShareAccess::NotFound,
    };

    if !share.is_active {
        return ShareAccess::Revoked;
    }

    if let Some(expires_at) = share.expires_at {
        if expires_at < now {
            return ShareAccess::Expired;
        }
    }

    if let Some(max) = share.max_downloads {
        if share.download_count >= max {
            return ShareAccess::Exhausted;
        }
    }

    if let Some(hash) = &share.password_hash {
        match password {
            Some(candidate) if verify_password(candidate, hash) => {}
            _ => return ShareAccess::PasswordRequired,
        }
    }

    ShareAccess::Valid
}

fn verify_password(candidate: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!("Unparsable share password hash: {}", e);
            false
        }
    }
}

pub struct CreateShareParams {
    pub file_id: String,
    pub password: Option<String>,
    /// None = policy default.
    pub max_downloads: Option<i32>,
    /// None = policy default lifetime.
    pub expires_in_days: Option<i64>,
    pub never_expires: bool,
    pub recipient_email: Option<String>,
    pub recipient_message: Option<String>,
}

/// Partial update. Outer None = leave alone, inner None = clear.
#[derive(Default)]
pub struct UpdateShareParams {
    pub password: Option<Option<String>>,
    pub max_downloads: Option<Option<i32>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

pub enum AccessDecision {
    Denied(ShareAccess),
    Granted {
        share: shares::Model,
        file: files::Model,
    },
}

pub type DeliveryBody = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A download that passed the gate and is ready to stream.
pub struct Delivery {
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub body: DeliveryBody,
}

pub enum DownloadOutcome {
    Denied(ShareAccess),
    Ready(Delivery),
}

/// Minimal public view of a folder-share entry. Nothing beyond what the
/// recipient needs to pick a file.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ShareListEntry {
    pub name: String,
    pub is_folder: bool,
    pub size: i64,
    pub mime_type: Option<String>,
}

pub enum ListOutcome {
    Denied(ShareAccess),
    Listing {
        folder_name: String,
        entries: Vec<ShareListEntry>,
    },
}

pub struct ShareService {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    forensic: ForensicService,
    notifier: Arc<dyn Notifier>,
    notify_opts: NotifyOptions,
    base_url: String,
    policy: PolicySettings,
}

impl ShareService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn StorageService>,
        forensic: ForensicService,
        notifier: Arc<dyn Notifier>,
        notify_opts: NotifyOptions,
        base_url: String,
        policy: PolicySettings,
    ) -> Self {
        Self {
            db,
            storage,
            forensic,
            notifier,
            notify_opts,
            base_url,
            policy,
        }
    }

    /// 32 random bytes as hex. Collisions are vanishingly unlikely but
    /// the unique index is the real guarantee, so retry a few times
    /// rather than trusting probability alone.
    async fn generate_token(&self) -> Result<String, AppError> {
        for _ in 0..5 {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            let token = hex::encode(bytes);

            let taken = Shares::find()
                .filter(shares::Column::Token.eq(&token))
                .one(&self.db)
                .await?
                .is_some();
            if !taken {
                return Ok(token);
            }
        }
        Err(AppError::Internal(
            "could not generate a unique share token".to_string(),
        ))
    }

    pub async fn create(
        &self,
        params: CreateShareParams,
        creator_id: &str,
        request: &RequestMeta,
    ) -> Result<shares::Model, AppError> {
        let file = Files::find_by_id(&params.file_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        if file.user_id.as_deref() != Some(creator_id) {
            return Err(AppError::Forbidden("Not the owner".to_string()));
        }

        let token = self.generate_token().await?;

        let password_hash = match &params.password {
            Some(password) if !password.is_empty() => {
                let salt = SaltString::generate(&mut OsRng);
                let hash = Argon2::default()
                    .hash_password(password.as_bytes(), &salt)
                    .map_err(|e| AppError::Internal(format!("hashing share password: {}", e)))?;
                Some(hash.to_string())
            }
            _ => None,
        };

        let expires_at = if params.never_expires {
            None
        } else {
            let days = params
                .expires_in_days
                .unwrap_or(self.policy.default_max_share_days);
            Some(Utc::now() + Duration::days(days))
        };

        let max_downloads = params
            .max_downloads
            .or(self.policy.default_max_downloads);

        let share = shares::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            token: Set(token),
            file_id: Set(file.id.clone()),
            created_by: Set(creator_id.to_string()),
            password_hash: Set(password_hash),
            max_downloads: Set(max_downloads),
            expires_at: Set(expires_at),
            is_active: Set(true),
            download_count: Set(0),
            last_accessed: Set(None),
            recipient_email: Set(params.recipient_email.clone()),
            recipient_message: Set(params.recipient_message.clone()),
            created_at: Set(Utc::now()),
        };
        let share = share.insert(&self.db).await?;

        self.set_file_shared(&file.id, true).await?;

        // Public hard-link so a static front can serve unprotected
        // files directly. Non-fatal: the streaming path does not need it.
        if !file.is_folder && share.password_hash.is_none() {
            if let Some(path) = &file.storage_path {
                if let Err(e) = self.storage.materialize_public(path, &share.token).await {
                    tracing::warn!("Public materialization for {} failed: {}", share.token, e);
                }
            }
        }

        if let Some(recipient) = &share.recipient_email {
            self.send_share_email(recipient, &share, &file);
        }

        self.forensic.log_event(
            Some(creator_id.to_string()),
            "share_create",
            "share",
            &share.id,
            format!("Shared {:?}", file.filename),
            Some(json!({
                "file_id": file.id,
                "ip": request.ip,
                "has_password": share.password_hash.is_some(),
                "max_downloads": share.max_downloads,
            })),
        );

        Ok(share)
    }

    fn send_share_email(&self, recipient: &str, share: &shares::Model, file: &files::Model) {
        let link = format!("{}/s/{}", self.base_url, share.token);
        let message = share
            .recipient_message
            .clone()
            .unwrap_or_else(|| "A file has been shared with you.".to_string());
        let body = format!(
            "<p>{}</p><p><a href=\"{}\">{}</a></p>",
            message, link, file.filename
        );
        let subject = format!("File shared with you: {}", file.filename);

        let notifier = self.notifier.clone();
        let opts = self.notify_opts.clone();
        let recipient = recipient.to_string();
        tokio::spawn(async move {
            if !notifier.send(&recipient, &subject, &body, &opts).await {
                tracing::warn!("Share notification to {} was not delivered", recipient);
            }
        });
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<shares::Model>, AppError> {
        Ok(Shares::find()
            .filter(shares::Column::CreatedBy.eq(user_id))
            .all(&self.db)
            .await?)
    }

    pub async fn update(
        &self,
        share_id: &str,
        acting_user_id: &str,
        acting_is_admin: bool,
        params: UpdateShareParams,
    ) -> Result<shares::Model, AppError> {
        let share = self.load_owned(share_id, acting_user_id, acting_is_admin).await?;

        let mut active: shares::ActiveModel = share.into();

        if let Some(password) = params.password {
            active.password_hash = Set(match password {
                Some(p) if !p.is_empty() => {
                    let salt = SaltString::generate(&mut OsRng);
                    let hash = Argon2::default()
                        .hash_password(p.as_bytes(), &salt)
                        .map_err(|e| {
                            AppError::Internal(format!("hashing share password: {}", e))
                        })?;
                    Some(hash.to_string())
                }
                _ => None,
            });
        }
        if let Some(max_downloads) = params.max_downloads {
            active.max_downloads = Set(max_downloads);
        }
        if let Some(expires_at) = params.expires_at {
            active.expires_at = Set(expires_at);
        }

        let updated = active.update(&self.db).await?;

        self.forensic.log_event(
            Some(acting_user_id.to_string()),
            "share_update",
            "share",
            &updated.id,
            "Share settings changed".to_string(),
            None,
        );

        Ok(updated)
    }

    pub async fn deactivate(
        &self,
        share_id: &str,
        acting_user_id: &str,
        acting_is_admin: bool,
    ) -> Result<(), AppError> {
        let share = self.load_owned(share_id, acting_user_id, acting_is_admin).await?;

        let mut active: shares::ActiveModel = share.clone().into();
        active.is_active = Set(false);
        active.update(&self.db).await?;

        self.cleanup_inactive(&share).await;
        self.recompute_file_shared(&share.file_id).await?;

        self.forensic.log_event(
            Some(acting_user_id.to_string()),
            "share_deactivate",
            "share",
            &share.id,
            "Share deactivated".to_string(),
            None,
        );

        Ok(())
    }

    pub async fn delete(
        &self,
        share_id: &str,
        acting_user_id: &str,
        acting_is_admin: bool,
    ) -> Result<(), AppError> {
        let share = self.load_owned(share_id, acting_user_id, acting_is_admin).await?;

        Shares::delete_by_id(&share.id).exec(&self.db).await?;

        self.cleanup_inactive(&share).await;
        self.recompute_file_shared(&share.file_id).await?;

        self.forensic.log_event(
            Some(acting_user_id.to_string()),
            "share_delete",
            "share",
            &share.id,
            "Share deleted".to_string(),
            None,
        );

        Ok(())
    }

    async fn load_owned(
        &self,
        share_id: &str,
        acting_user_id: &str,
        acting_is_admin: bool,
    ) -> Result<shares::Model, AppError> {
        let share = Shares::find_by_id(share_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("Share not found".to_string()))?;
        if !acting_is_admin && share.created_by != acting_user_id {
            return Err(AppError::Forbidden("Not the owner".to_string()));
        }
        Ok(share)
    }

    async fn cleanup_inactive(&self, share: &shares::Model) {
        if let Err(e) = self.storage.remove_public(&share.token).await {
            tracing::warn!("Failed to remove public copy {}: {}", share.token, e);
        }
    }

    /// Rollup: `files.is_shared` is true while at least one active share
    /// references the row.
    pub async fn recompute_file_shared(&self, file_id: &str) -> Result<(), AppError> {
        let has_active = Shares::find()
            .filter(shares::Column::FileId.eq(file_id))
            .filter(shares::Column::IsActive.eq(true))
            .one(&self.db)
            .await?
            .is_some();
        self.set_file_shared(file_id, has_active).await
    }

    async fn set_file_shared(&self, file_id: &str, is_shared: bool) -> Result<(), AppError> {
        Files::update_many()
            .col_expr(files::Column::IsShared, Expr::value(is_shared))
            .filter(files::Column::Id.eq(file_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Public info/state lookup for a token. Updates `last_accessed`
    /// best-effort on a granted lookup.
    pub async fn access(
        &self,
        token: &str,
        password: Option<&str>,
        request: &RequestMeta,
    ) -> Result<AccessDecision, AppError> {
        let share = Shares::find()
            .filter(shares::Column::Token.eq(token))
            .one(&self.db)
            .await?;

        match evaluate_access(share.as_ref(), Utc::now(), password) {
            ShareAccess::Valid => {}
            ShareAccess::PasswordRequired => {
                if password.is_some() {
                    self.forensic.log_security_event(
                        "share_password_failed",
                        Severity::Medium,
                        request,
                        None,
                        format!("Wrong password for share token {}", token),
                        None,
                    );
                }
                return Ok(AccessDecision::Denied(ShareAccess::PasswordRequired));
            }
            denied => return Ok(AccessDecision::Denied(denied)),
        }

        // evaluate_access returned Valid, so the row exists.
        let share = match share {
            Some(s) => s,
            None => return Ok(AccessDecision::Denied(ShareAccess::NotFound)),
        };

        let file = match Files::find_by_id(&share.file_id).one(&self.db).await? {
            Some(f) => f,
            None => return Ok(AccessDecision::Denied(ShareAccess::NotFound)),
        };

        self.touch_last_accessed(share.id.clone());

        Ok(AccessDecision::Granted { share, file })
    }

    /// Best-effort timestamp bump, never on the request's critical path.
    fn touch_last_accessed(&self, share_id: String) {
        let db = self.db.clone();
        tokio::spawn(async move {
            let result = Shares::update_many()
                .col_expr(shares::Column::LastAccessed, Expr::value(Utc::now()))
                .filter(shares::Column::Id.eq(&share_id))
                .exec(&db)
                .await;
            if let Err(e) = result {
                tracing::warn!("Failed to touch last_accessed for {}: {}", share_id, e);
            }
        });
    }

    /// Full download chain: gate, path resolution with traversal
    /// defense, on-disk existence before any counter touch, atomic
    /// compare-and-set increment, deactivation at the limit, then the
    /// byte-counting stream.
    pub async fn download(
        &self,
        token: &str,
        password: Option<&str>,
        request: &RequestMeta,
    ) -> Result<DownloadOutcome, AppError> {
        let (share, file) = match self.access(token, password, request).await? {
            AccessDecision::Granted { share, file } => (share, file),
            AccessDecision::Denied(state) => return Ok(DownloadOutcome::Denied(state)),
        };

        let (source_path, filename, mime_type, size, is_temp) = if file.is_folder {
            let zip_path = self.build_zip(&file).await?;
            let size = tokio::fs::metadata(&zip_path)
                .await
                .map_err(|e| AppError::Internal(format!("sizing zip: {}", e)))?
                .len() as i64;
            (
                zip_path,
                format!("{}.zip", file.filename),
                "application/zip".to_string(),
                size,
                true,
            )
        } else {
            let relative = match &file.storage_path {
                Some(p) => p.clone(),
                None => return Ok(DownloadOutcome::Denied(ShareAccess::NotFound)),
            };
            let abs = match self.storage.resolve(&relative) {
                Some(p) => p,
                None => {
                    self.forensic.log_security_event(
                        "path_traversal_attempt",
                        Severity::High,
                        request,
                        None,
                        format!("Stored path escapes the storage root: {}", relative),
                        Some(json!({ "file_id": file.id })),
                    );
                    return Ok(DownloadOutcome::Denied(ShareAccess::NotFound));
                }
            };
            if tokio::fs::metadata(&abs).await.is_err() {
                tracing::error!("Stored file missing on disk: {}", relative);
                return Ok(DownloadOutcome::Denied(ShareAccess::NotFound));
            }
            (
                abs,
                file.filename.clone(),
                file.mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                file.size,
                false,
            )
        };

        // The concurrency invariant: one committed increment per served
        // download, enforced in a single UPDATE. Losing the race at the
        // limit means this request is rejected.
        let incremented = Shares::update_many()
            .col_expr(
                shares::Column::DownloadCount,
                Expr::col(shares::Column::DownloadCount).add(1),
            )
            .col_expr(shares::Column::LastAccessed, Expr::value(Utc::now()))
            .filter(shares::Column::Id.eq(&share.id))
            .filter(shares::Column::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(shares::Column::MaxDownloads.is_null())
                    .add(
                        Expr::col(shares::Column::DownloadCount)
                            .lt(Expr::col(shares::Column::MaxDownloads)),
                    ),
            )
            .exec(&self.db)
            .await?;

        if incremented.rows_affected == 0 {
            if is_temp {
                let _ = tokio::fs::remove_file(&source_path).await;
            }
            return Ok(DownloadOutcome::Denied(ShareAccess::Exhausted));
        }

        self.deactivate_if_exhausted(&share).await?;

        let correlation = self
            .forensic
            .log_download(&file.id, Some(&share.id), None, request)
            .await;

        if share.recipient_email.is_some() {
            self.notify_owner_of_download(&share, &file, request).await;
        }

        let guard = CompletionGuard {
            forensic: self.forensic.clone(),
            correlation,
            bytes: 0,
            finished: false,
            cleanup: is_temp.then(|| source_path.clone()),
        };

        Ok(DownloadOutcome::Ready(Delivery {
            filename,
            mime_type,
            size,
            body: counting_stream(source_path, self.policy.stream_chunk_size, guard),
        }))
    }

    /// Inline variant of `download`: same gate and accounting, no
    /// recipient notice, and folders are not inlineable.
    pub async fn stream_inline(
        &self,
        token: &str,
        password: Option<&str>,
        request: &RequestMeta,
    ) -> Result<DownloadOutcome, AppError> {
        let (share, file) = match self.access(token, password, request).await? {
            AccessDecision::Granted { share, file } => (share, file),
            AccessDecision::Denied(state) => return Ok(DownloadOutcome::Denied(state)),
        };

        if file.is_folder {
            return Err(AppError::BadRequest(
                "Folders cannot be displayed inline".to_string(),
            ));
        }

        let relative = match &file.storage_path {
            Some(p) => p.clone(),
            None => return Ok(DownloadOutcome::Denied(ShareAccess::NotFound)),
        };
        let abs = match self.storage.resolve(&relative) {
            Some(p) => p,
            None => {
                self.forensic.log_security_event(
                    "path_traversal_attempt",
                    Severity::High,
                    request,
                    None,
                    format!("Stored path escapes the storage root: {}", relative),
                    Some(json!({ "file_id": file.id })),
                );
                return Ok(DownloadOutcome::Denied(ShareAccess::NotFound));
            }
        };
        if tokio::fs::metadata(&abs).await.is_err() {
            tracing::error!("Stored file missing on disk: {}", relative);
            return Ok(DownloadOutcome::Denied(ShareAccess::NotFound));
        }

        let incremented = Shares::update_many()
            .col_expr(
                shares::Column::DownloadCount,
                Expr::col(shares::Column::DownloadCount).add(1),
            )
            .col_expr(shares::Column::LastAccessed, Expr::value(Utc::now()))
            .filter(shares::Column::Id.eq(&share.id))
            .filter(shares::Column::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(shares::Column::MaxDownloads.is_null())
                    .add(
                        Expr::col(shares::Column::DownloadCount)
                            .lt(Expr::col(shares::Column::MaxDownloads)),
                    ),
            )
            .exec(&self.db)
            .await?;

        if incremented.rows_affected == 0 {
            return Ok(DownloadOutcome::Denied(ShareAccess::Exhausted));
        }

        self.deactivate_if_exhausted(&share).await?;

        let correlation = self
            .forensic
            .log_download(&file.id, Some(&share.id), None, request)
            .await;

        let guard = CompletionGuard {
            forensic: self.forensic.clone(),
            correlation,
            bytes: 0,
            finished: false,
            cleanup: None,
        };

        Ok(DownloadOutcome::Ready(Delivery {
            filename: file.filename.clone(),
            mime_type: file
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: file.size,
            body: counting_stream(abs, self.policy.stream_chunk_size, guard),
        }))
    }

    /// When the increment just hit the cap, flip the share off and pull
    /// its public copy. Clean-up failures are logged, not surfaced.
    async fn deactivate_if_exhausted(&self, share: &shares::Model) -> Result<(), AppError> {
        let deactivated = Shares::update_many()
            .col_expr(shares::Column::IsActive, Expr::value(false))
            .filter(shares::Column::Id.eq(&share.id))
            .filter(shares::Column::MaxDownloads.is_not_null())
            .filter(
                Expr::col(shares::Column::DownloadCount)
                    .gte(Expr::col(shares::Column::MaxDownloads)),
            )
            .exec(&self.db)
            .await?;

        if deactivated.rows_affected > 0 {
            self.cleanup_inactive(share).await;
            self.recompute_file_shared(&share.file_id).await?;
        }
        Ok(())
    }

    /// Who/when/how-much notice to the share's creator. The recipient
    /// address on the share only enables the notice; the message goes to
    /// the owner, never to the downloader.
    async fn notify_owner_of_download(
        &self,
        share: &shares::Model,
        file: &files::Model,
        request: &RequestMeta,
    ) {
        let owner = match Users::find_by_id(&share.created_by).one(&self.db).await {
            Ok(Some(owner)) => owner,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Owner lookup for download notice failed: {}", e);
                return;
            }
        };
        let owner_email = match owner.email {
            Some(email) => email,
            None => return,
        };

        let body = format!(
            "<p>{:?} was downloaded ({} bytes).</p><p>Client: {} / {}</p>",
            file.filename,
            file.size,
            request.ip.as_deref().unwrap_or("unknown"),
            request.user_agent.as_deref().unwrap_or("unknown"),
        );
        let subject = format!("Download notice: {}", file.filename);

        let notifier = self.notifier.clone();
        let opts = self.notify_opts.clone();
        tokio::spawn(async move {
            if !notifier.send(&owner_email, &subject, &body, &opts).await {
                tracing::warn!("Download notice to {} was not delivered", owner_email);
            }
        });
    }

    /// Direct children of a shared folder, gated like any other access.
    pub async fn list_folder(
        &self,
        token: &str,
        password: Option<&str>,
        request: &RequestMeta,
    ) -> Result<ListOutcome, AppError> {
        let (_, folder) = match self.access(token, password, request).await? {
            AccessDecision::Granted { share, file } => (share, file),
            AccessDecision::Denied(state) => return Ok(ListOutcome::Denied(state)),
        };

        if !folder.is_folder {
            return Err(AppError::BadRequest("Share is not a folder".to_string()));
        }

        let children = Files::find()
            .filter(files::Column::ParentId.eq(&folder.id))
            .all(&self.db)
            .await?;

        let entries = children
            .into_iter()
            .map(|c| ShareListEntry {
                name: c.filename,
                is_folder: c.is_folder,
                size: c.size,
                mime_type: c.mime_type,
            })
            .collect();

        Ok(ListOutcome::Listing {
            folder_name: folder.filename,
            entries,
        })
    }

    /// Assembles the folder's descendant files into a zip in the staging
    /// area. Built before the counter increment, so an assembly failure
    /// never burns a download.
    async fn build_zip(&self, folder: &files::Model) -> Result<PathBuf, AppError> {
        let mut entries: Vec<(PathBuf, String)> = Vec::new();
        self.collect_zip_entries(folder, "", &mut entries).await?;

        let zip_path = self
            .storage
            .staging_dir()
            .join(format!("zip-{}", Uuid::new_v4()));
        let out_path = zip_path.clone();

        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let out = std::fs::File::create(&out_path)?;
            let mut zip = zip::ZipWriter::new(out);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (abs, name) in entries {
                zip.start_file(name, options)?;
                let mut src = std::fs::File::open(&abs)?;
                std::io::copy(&mut src, &mut zip)?;
            }
            zip.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("zip task panicked: {}", e)))?;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&zip_path).await;
            return Err(AppError::Internal(format!("assembling zip: {}", e)));
        }

        Ok(zip_path)
    }

    #[async_recursion]
    async fn collect_zip_entries(
        &self,
        folder: &files::Model,
        prefix: &str,
        entries: &mut Vec<(PathBuf, String)>,
    ) -> Result<(), AppError> {
        let children = Files::find()
            .filter(files::Column::ParentId.eq(&folder.id))
            .all(&self.db)
            .await?;

        for child in &children {
            let name = if prefix.is_empty() {
                child.filename.clone()
            } else {
                format!("{}/{}", prefix, child.filename)
            };

            if child.is_folder {
                self.collect_zip_entries(child, &name, entries).await?;
            } else if let Some(path) = &child.storage_path {
                if let Some(abs) = self.storage.resolve(path) {
                    entries.push((abs, name));
                } else {
                    tracing::warn!("Skipping zip entry with escaping path: {}", path);
                }
            }
        }
        Ok(())
    }

    /// Bulk sweep: turns off every active share whose expiry has passed,
    /// pulls public copies and recomputes rollups. Idempotent; returns
    /// the affected count.
    pub async fn deactivate_expired(&self) -> Result<u64, AppError> {
        let expired = Shares::find()
            .filter(shares::Column::IsActive.eq(true))
            .filter(shares::Column::ExpiresAt.is_not_null())
            .filter(shares::Column::ExpiresAt.lt(Utc::now()))
            .all(&self.db)
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = expired.iter().map(|s| s.id.clone()).collect();
        Shares::update_many()
            .col_expr(shares::Column::IsActive, Expr::value(false))
            .filter(shares::Column::Id.is_in(ids))
            .exec(&self.db)
            .await?;

        for share in &expired {
            self.cleanup_inactive(share).await;
            self.recompute_file_shared(&share.file_id).await?;
        }

        tracing::info!("Deactivated {} expired shares", expired.len());
        Ok(expired.len() as u64)
    }
}

/// Stamps the download-log row when the stream ends, whether by EOF or
/// by the client going away mid-transfer.
struct CompletionGuard {
    forensic: ForensicService,
    correlation: Option<String>,
    bytes: u64,
    finished: bool,
    cleanup: Option<PathBuf>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.correlation.take() {
            // 499 is the de-facto "client closed request" status.
            let status = if self.finished { 200 } else { 499 };
            self.forensic.complete_download(id, self.bytes as i64, status);
        }
        if let Some(path) = self.cleanup.take() {
            tokio::spawn(async move {
                let _ = tokio::fs::remove_file(&path).await;
            });
        }
    }
}

fn counting_stream(path: PathBuf, chunk_size: usize, guard: CompletionGuard) -> DeliveryBody {
    Box::pin(async_stream::stream! {
        let mut guard = guard;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut buf = vec![0u8; chunk_size];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => {
                    guard.finished = true;
                    break;
                }
                Ok(n) => {
                    guard.bytes += n as u64;
                    yield Ok(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
