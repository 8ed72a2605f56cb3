use crate::api::error::AppError;
use crate::api::handlers::request_meta;
use crate::services::forensic::Severity;
use crate::services::share_service::{
    AccessDecision, CreateShareParams, Delivery, DownloadOutcome, ListOutcome, ShareAccess,
    ShareListEntry, UpdateShareParams,
};
use crate::utils::auth::Claims;
use crate::utils::validation::{check_ip_rate_limit, detect_xss};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sea_orm::EntityTrait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

const PASSWORD_MAX_ATTEMPTS: u64 = 10;
const PASSWORD_WINDOW_MINUTES: i64 = 15;

// ── Request / Response Types ──────────────────────────────────────────

#[derive(Deserialize, ToSchema)]
pub struct CreateShareRequest {
    pub file_id: String,
    pub password: Option<String>,
    pub max_downloads: Option<i32>,
    pub expires_in_days: Option<i64>,
    #[serde(default)]
    pub never_expires: bool,
    pub recipient_email: Option<String>,
    pub recipient_message: Option<String>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct UpdateShareRequest {
    pub password: Option<String>,
    #[serde(default)]
    pub clear_password: bool,
    pub max_downloads: Option<i32>,
    #[serde(default)]
    pub clear_max_downloads: bool,
    pub expires_in_days: Option<i64>,
    #[serde(default)]
    pub never_expires: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ShareResponse {
    pub id: String,
    pub token: String,
    pub url: String,
    pub file_id: String,
    pub has_password: bool,
    pub max_downloads: Option<i32>,
    pub download_count: i32,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub is_active: bool,
    pub last_accessed: Option<chrono::DateTime<Utc>>,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct PublicShareInfoResponse {
    pub filename: String,
    pub is_folder: bool,
    pub size: i64,
    pub mime_type: Option<String>,
    pub requires_password: bool,
}

#[derive(Serialize, ToSchema)]
pub struct PublicFolderListing {
    pub folder_name: String,
    pub entries: Vec<ShareListEntry>,
}

#[derive(Deserialize)]
pub struct AccessQuery {
    pub password: Option<String>,
}

fn share_response(share: crate::entities::shares::Model, base_url: &str) -> ShareResponse {
    ShareResponse {
        url: format!("{}/s/{}", base_url, share.token),
        id: share.id,
        token: share.token,
        file_id: share.file_id,
        has_password: share.password_hash.is_some(),
        max_downloads: share.max_downloads,
        download_count: share.download_count,
        expires_at: share.expires_at,
        is_active: share.is_active,
        last_accessed: share.last_accessed,
        created_at: share.created_at,
    }
}

/// All terminal denial states collapse into one response. A caller
/// probing tokens cannot tell absent from revoked from expired from
/// used-up.
fn denied_response(state: ShareAccess) -> Response {
    match state {
        ShareAccess::PasswordRequired => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "requires_password": true })),
        )
            .into_response(),
        _ => AppError::Gone("This share is no longer available".to_string()).into_response(),
    }
}

/// Password guessing against a token is rate limited per IP, fed by the
/// failure events the gate itself records.
async fn check_password_attempts(
    state: &crate::AppState,
    meta: &crate::services::forensic::RequestMeta,
    attempted_password: bool,
) -> Result<(), AppError> {
    if !attempted_password {
        return Ok(());
    }
    if let Some(ip) = &meta.ip {
        if !check_ip_rate_limit(
            &state.db,
            ip,
            "share_password_failed",
            PASSWORD_MAX_ATTEMPTS,
            PASSWORD_WINDOW_MINUTES,
        )
        .await
        {
            state.forensic.log_security_event(
                "share_password_rate_limited",
                Severity::High,
                meta,
                None,
                format!("Share password rate limit hit for {}", ip),
                None,
            );
            return Err(AppError::RateLimited(
                "Too many attempts, try again later".to_string(),
            ));
        }
    }
    Ok(())
}

// ── Authenticated Endpoints ───────────────────────────────────────────

#[utoipa::path(
    post,
    path = "/shares",
    request_body = CreateShareRequest,
    responses(
        (status = 201, description = "Share link created", body = ShareResponse),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "File not found")
    ),
    security(("jwt" = [])),
    tag = "shares"
)]
pub async fn create_share(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(req): Json<CreateShareRequest>,
) -> Result<(StatusCode, Json<ShareResponse>), AppError> {
    let meta = request_meta(&headers);

    if let Some(days) = req.expires_in_days {
        if days <= 0 {
            return Err(AppError::BadRequest("Expiry must be positive".to_string()));
        }
        if days > 365 {
            return Err(AppError::BadRequest(
                "Expiry cannot exceed 1 year".to_string(),
            ));
        }
    }
    if let Some(max) = req.max_downloads {
        if max <= 0 {
            return Err(AppError::BadRequest(
                "max_downloads must be positive".to_string(),
            ));
        }
    }

    if let Some(message) = &req.recipient_message {
        if detect_xss(message) {
            state.forensic.log_security_event(
                "xss_attempt",
                Severity::Medium,
                &meta,
                Some(claims.sub.clone()),
                "Script markup in share recipient message".to_string(),
                None,
            );
            return Err(AppError::BadRequest(
                "Message contains disallowed markup".to_string(),
            ));
        }
    }

    let share = state
        .share_service
        .create(
            CreateShareParams {
                file_id: req.file_id,
                password: req.password,
                max_downloads: req.max_downloads,
                expires_in_days: req.expires_in_days,
                never_expires: req.never_expires,
                recipient_email: req.recipient_email,
                recipient_message: req.recipient_message,
            },
            &claims.sub,
            &meta,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(share_response(share, &state.config.base_url)),
    ))
}

#[utoipa::path(
    get,
    path = "/shares",
    responses(
        (status = 200, description = "Shares created by the caller", body = [ShareResponse])
    ),
    security(("jwt" = [])),
    tag = "shares"
)]
pub async fn list_shares(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ShareResponse>>, AppError> {
    let shares = state.share_service.list_for_user(&claims.sub).await?;
    Ok(Json(
        shares
            .into_iter()
            .map(|s| share_response(s, &state.config.base_url))
            .collect(),
    ))
}

#[utoipa::path(
    patch,
    path = "/shares/{id}",
    params(("id" = String, Path, description = "Share ID")),
    request_body = UpdateShareRequest,
    responses(
        (status = 200, description = "Share updated", body = ShareResponse),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Share not found")
    ),
    security(("jwt" = [])),
    tag = "shares"
)]
pub async fn update_share(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(share_id): Path<String>,
    Json(req): Json<UpdateShareRequest>,
) -> Result<Json<ShareResponse>, AppError> {
    let user = crate::entities::prelude::Users::find_by_id(&claims.sub)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unknown user".to_string()))?;

    let mut params = UpdateShareParams::default();
    if req.clear_password {
        params.password = Some(None);
    } else if req.password.is_some() {
        params.password = Some(req.password);
    }
    if req.clear_max_downloads {
        params.max_downloads = Some(None);
    } else if req.max_downloads.is_some() {
        params.max_downloads = Some(req.max_downloads);
    }
    if req.never_expires {
        params.expires_at = Some(None);
    } else if let Some(days) = req.expires_in_days {
        if days <= 0 {
            return Err(AppError::BadRequest("Expiry must be positive".to_string()));
        }
        params.expires_at = Some(Some(Utc::now() + chrono::Duration::days(days)));
    }

    let updated = state
        .share_service
        .update(&share_id, &user.id, user.is_admin, params)
        .await?;

    Ok(Json(share_response(updated, &state.config.base_url)))
}

#[utoipa::path(
    post,
    path = "/shares/{id}/deactivate",
    params(("id" = String, Path, description = "Share ID")),
    responses(
        (status = 200, description = "Share deactivated"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Share not found")
    ),
    security(("jwt" = [])),
    tag = "shares"
)]
pub async fn deactivate_share(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(share_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = crate::entities::prelude::Users::find_by_id(&claims.sub)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unknown user".to_string()))?;

    state
        .share_service
        .deactivate(&share_id, &user.id, user.is_admin)
        .await?;

    Ok(Json(json!({ "deactivated": true })))
}

#[utoipa::path(
    delete,
    path = "/shares/{id}",
    params(("id" = String, Path, description = "Share ID")),
    responses(
        (status = 200, description = "Share deleted"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Share not found")
    ),
    security(("jwt" = [])),
    tag = "shares"
)]
pub async fn delete_share(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(share_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = crate::entities::prelude::Users::find_by_id(&claims.sub)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unknown user".to_string()))?;

    state
        .share_service
        .delete(&share_id, &user.id, user.is_admin)
        .await?;

    Ok(Json(json!({ "deleted": true })))
}

// ── Public Endpoints ──────────────────────────────────────────────────

#[utoipa::path(
    get,
    path = "/s/{token}",
    params(
        ("token" = String, Path, description = "Share token"),
        ("password" = Option<String>, Query, description = "Share password")
    ),
    responses(
        (status = 200, description = "Share info", body = PublicShareInfoResponse),
        (status = 401, description = "Password required"),
        (status = 410, description = "Share unavailable")
    ),
    tag = "public"
)]
pub async fn get_share_info(
    State(state): State<crate::AppState>,
    Path(token): Path<String>,
    Query(query): Query<AccessQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let meta = request_meta(&headers);
    check_password_attempts(&state, &meta, query.password.is_some()).await?;

    match state
        .share_service
        .access(&token, query.password.as_deref(), &meta)
        .await?
    {
        AccessDecision::Denied(denied) => Ok(denied_response(denied)),
        AccessDecision::Granted { share, file } => Ok(Json(PublicShareInfoResponse {
            filename: file.filename,
            is_folder: file.is_folder,
            size: file.size,
            mime_type: file.mime_type,
            requires_password: share.password_hash.is_some(),
        })
        .into_response()),
    }
}

fn delivery_response(delivery: Delivery, disposition: &str, cacheable: bool) -> Response {
    let encoded_name =
        utf8_percent_encode(&delivery.filename, NON_ALPHANUMERIC).to_string();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, delivery.mime_type)
        .header(header::CONTENT_LENGTH, delivery.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("{}; filename*=UTF-8''{}", disposition, encoded_name),
        )
        // Share links are capabilities; keep crawlers away from them.
        .header("X-Robots-Tag", "noindex, nofollow");

    builder = if cacheable {
        builder.header(header::CACHE_CONTROL, "public, max-age=3600")
    } else {
        builder.header(header::CACHE_CONTROL, "no-store")
    };

    builder
        .body(Body::from_stream(delivery.body))
        .unwrap_or_else(|e| {
            tracing::error!("Failed to build delivery response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[utoipa::path(
    get,
    path = "/s/{token}/download",
    params(
        ("token" = String, Path, description = "Share token"),
        ("password" = Option<String>, Query, description = "Share password")
    ),
    responses(
        (status = 200, description = "File stream"),
        (status = 401, description = "Password required"),
        (status = 410, description = "Share unavailable")
    ),
    tag = "public"
)]
pub async fn download_share(
    State(state): State<crate::AppState>,
    Path(token): Path<String>,
    Query(query): Query<AccessQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let meta = request_meta(&headers);
    check_password_attempts(&state, &meta, query.password.is_some()).await?;

    match state
        .share_service
        .download(&token, query.password.as_deref(), &meta)
        .await?
    {
        DownloadOutcome::Denied(denied) => Ok(denied_response(denied)),
        DownloadOutcome::Ready(delivery) => Ok(delivery_response(delivery, "attachment", false)),
    }
}

#[utoipa::path(
    get,
    path = "/s/{token}/inline",
    params(
        ("token" = String, Path, description = "Share token"),
        ("password" = Option<String>, Query, description = "Share password")
    ),
    responses(
        (status = 200, description = "Inline file stream"),
        (status = 401, description = "Password required"),
        (status = 410, description = "Share unavailable")
    ),
    tag = "public"
)]
pub async fn inline_share(
    State(state): State<crate::AppState>,
    Path(token): Path<String>,
    Query(query): Query<AccessQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let meta = request_meta(&headers);
    check_password_attempts(&state, &meta, query.password.is_some()).await?;

    match state
        .share_service
        .stream_inline(&token, query.password.as_deref(), &meta)
        .await?
    {
        DownloadOutcome::Denied(denied) => Ok(denied_response(denied)),
        DownloadOutcome::Ready(delivery) => Ok(delivery_response(delivery, "inline", true)),
    }
}

#[utoipa::path(
    get,
    path = "/s/{token}/list",
    params(
        ("token" = String, Path, description = "Share token"),
        ("password" = Option<String>, Query, description = "Share password")
    ),
    responses(
        (status = 200, description = "Folder listing", body = PublicFolderListing),
        (status = 400, description = "Share is not a folder"),
        (status = 401, description = "Password required"),
        (status = 410, description = "Share unavailable")
    ),
    tag = "public"
)]
pub async fn list_share(
    State(state): State<crate::AppState>,
    Path(token): Path<String>,
    Query(query): Query<AccessQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let meta = request_meta(&headers);
    check_password_attempts(&state, &meta, query.password.is_some()).await?;

    match state
        .share_service
        .list_folder(&token, query.password.as_deref(), &meta)
        .await?
    {
        ListOutcome::Denied(denied) => Ok(denied_response(denied)),
        ListOutcome::Listing {
            folder_name,
            entries,
        } => Ok(Json(PublicFolderListing {
            folder_name,
            entries,
        })
        .into_response()),
    }
}
