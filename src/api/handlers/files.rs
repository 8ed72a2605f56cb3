use crate::api::error::AppError;
use crate::api::handlers::request_meta;
use crate::entities::{files, prelude::*, users};
use crate::services::file_service::{
    UploadMeta, UploadOutcome, UploadRejection, UploadSource,
};
use crate::utils::auth::Claims;
use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::TryStreamExt;
use sea_orm::EntityTrait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::StreamReader;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, ToSchema)]
pub struct FileResponse {
    pub id: String,
    pub filename: String,
    pub is_folder: bool,
    pub parent_id: Option<String>,
    pub size: i64,
    pub mime_type: Option<String>,
    pub content_hash: Option<String>,
    pub is_shared: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<files::Model> for FileResponse {
    fn from(f: files::Model) -> Self {
        Self {
            id: f.id,
            filename: f.filename,
            is_folder: f.is_folder,
            parent_id: f.parent_id,
            size: f.size,
            mime_type: f.mime_type,
            content_hash: f.content_hash,
            is_shared: f.is_shared,
            created_at: f.created_at,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct ReassignRequest {
    pub new_owner_id: String,
}

async fn load_user(state: &crate::AppState, claims: &Claims) -> Result<users::Model, AppError> {
    Users::find_by_id(&claims.sub)
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unknown user".to_string()))
}

fn rejection_response(rejection: UploadRejection) -> Response {
    let status = match rejection {
        UploadRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(json!({
            "error": {
                "code": rejection.code(),
                "message": rejection.message(),
            }
        })),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/upload",
    responses(
        (status = 201, description = "File stored", body = FileResponse),
        (status = 400, description = "Upload rejected"),
        (status = 413, description = "File too large")
    ),
    security(("jwt" = [])),
    tag = "files"
)]
pub async fn upload_file(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let meta = request_meta(&headers);

    let mut staged = None;
    let mut parent_id: Option<String> = None;
    let mut description: Option<String> = None;
    let mut allow_duplicates = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let declared_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| AppError::BadRequest("Missing filename".to_string()))?;

                let reader = StreamReader::new(
                    field.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
                );

                match state
                    .file_service
                    .stage(
                        UploadSource::Stream {
                            reader: Box::new(reader),
                            declared_name,
                        },
                        &meta,
                    )
                    .await?
                {
                    crate::services::file_service::StageOutcome::Staged(s) => staged = Some(s),
                    crate::services::file_service::StageOutcome::Rejected(r) => {
                        return Ok(rejection_response(r));
                    }
                }
            }
            "parent_id" => {
                let value = field.text().await.unwrap_or_default();
                if !value.is_empty() {
                    parent_id = Some(value);
                }
            }
            "description" => {
                let value = field.text().await.unwrap_or_default();
                if !value.is_empty() {
                    description = Some(value);
                }
            }
            "allow_duplicates" => {
                allow_duplicates = field.text().await.unwrap_or_default() == "true";
            }
            _ => {}
        }
    }

    let staged = staged.ok_or_else(|| AppError::BadRequest("Missing file field".to_string()))?;

    let outcome = state
        .file_service
        .finalize(
            staged,
            UploadMeta {
                file_id: Uuid::new_v4().to_string(),
                owner_id: claims.sub.clone(),
                parent_id,
                description,
                allow_duplicates,
                request: meta,
            },
        )
        .await?;

    match outcome {
        UploadOutcome::Accepted(model) => Ok((
            StatusCode::CREATED,
            Json(FileResponse::from(model)),
        )
            .into_response()),
        UploadOutcome::Rejected(rejection) => Ok(rejection_response(rejection)),
    }
}

#[utoipa::path(
    post,
    path = "/folders",
    request_body = CreateFolderRequest,
    responses(
        (status = 201, description = "Folder created", body = FileResponse),
        (status = 400, description = "Invalid name or parent")
    ),
    security(("jwt" = [])),
    tag = "files"
)]
pub async fn create_folder(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<FileResponse>), AppError> {
    let folder = state
        .file_service
        .create_folder(claims.sub, req.name, req.parent_id)
        .await?;

    Ok((StatusCode::CREATED, Json(folder.into())))
}

#[utoipa::path(
    delete,
    path = "/files/{id}",
    params(("id" = String, Path, description = "File or folder ID")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Not found")
    ),
    security(("jwt" = [])),
    tag = "files"
)]
pub async fn delete_item(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(file_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = load_user(&state, &claims).await?;

    let deleted = state
        .file_service
        .delete_item(&file_id, &user.id, user.is_admin)
        .await?;

    Ok(Json(json!({ "deleted": deleted })))
}

#[utoipa::path(
    post,
    path = "/files/{id}/reassign",
    params(("id" = String, Path, description = "File ID")),
    request_body = ReassignRequest,
    responses(
        (status = 200, description = "Ownership moved", body = FileResponse),
        (status = 400, description = "Target over quota"),
        (status = 403, description = "Admin only")
    ),
    security(("jwt" = [])),
    tag = "files"
)]
pub async fn reassign_owner(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(file_id): Path<String>,
    Json(req): Json<ReassignRequest>,
) -> Result<Json<FileResponse>, AppError> {
    let user = load_user(&state, &claims).await?;
    if !user.is_admin {
        return Err(AppError::Forbidden(
            "Only administrators can reassign ownership".to_string(),
        ));
    }

    let updated = state
        .file_service
        .reassign_owner(&file_id, &req.new_owner_id, &user.id)
        .await?;

    Ok(Json(updated.into()))
}
