pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::{AppConfig, PolicySettings};
use crate::services::file_service::FileService;
use crate::services::forensic::ForensicService;
use crate::services::share_service::ShareService;
use crate::services::storage::StorageService;
use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::login,
        api::handlers::files::upload_file,
        api::handlers::files::create_folder,
        api::handlers::files::delete_item,
        api::handlers::files::reassign_owner,
        api::handlers::shares::create_share,
        api::handlers::shares::list_shares,
        api::handlers::shares::update_share,
        api::handlers::shares::deactivate_share,
        api::handlers::shares::delete_share,
        api::handlers::shares::get_share_info,
        api::handlers::shares::download_share,
        api::handlers::shares::inline_share,
        api::handlers::shares::list_share,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::auth::LoginRequest,
            api::handlers::auth::AuthResponse,
            api::handlers::files::FileResponse,
            api::handlers::files::CreateFolderRequest,
            api::handlers::files::ReassignRequest,
            api::handlers::shares::CreateShareRequest,
            api::handlers::shares::UpdateShareRequest,
            api::handlers::shares::ShareResponse,
            api::handlers::shares::PublicShareInfoResponse,
            api::handlers::shares::PublicFolderListing,
            api::handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "auth", description = "Authentication endpoints"),
        (name = "files", description = "File and folder management"),
        (name = "shares", description = "Share link management"),
        (name = "public", description = "Public share access")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub storage: Arc<dyn StorageService>,
    pub forensic: ForensicService,
    pub file_service: Arc<FileService>,
    pub share_service: Arc<ShareService>,
    pub config: AppConfig,
    pub policy: PolicySettings,
}

pub fn create_app(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/login", post(api::handlers::auth::login))
        .route(
            "/upload",
            post(api::handlers::files::upload_file)
                .layer(axum::extract::DefaultBodyLimit::max(
                    // Buffer for multipart framing overhead.
                    state.policy.max_file_size_bytes as usize + 10 * 1024 * 1024,
                ))
                .layer(from_fn_with_state(
                    state.clone(),
                    api::middleware::auth::auth_middleware,
                )),
        )
        .route(
            "/folders",
            post(api::handlers::files::create_folder).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/files/:id",
            axum::routing::delete(api::handlers::files::delete_item).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/files/:id/reassign",
            post(api::handlers::files::reassign_owner).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/shares",
            post(api::handlers::shares::create_share)
                .get(api::handlers::shares::list_shares)
                .layer(from_fn_with_state(
                    state.clone(),
                    api::middleware::auth::auth_middleware,
                )),
        )
        .route(
            "/shares/:id",
            axum::routing::patch(api::handlers::shares::update_share)
                .delete(api::handlers::shares::delete_share)
                .layer(from_fn_with_state(
                    state.clone(),
                    api::middleware::auth::auth_middleware,
                )),
        )
        .route(
            "/shares/:id/deactivate",
            post(api::handlers::shares::deactivate_share).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route("/s/:token", get(api::handlers::shares::get_share_info))
        .route(
            "/s/:token/download",
            get(api::handlers::shares::download_share),
        )
        .route("/s/:token/inline", get(api::handlers::shares::inline_share))
        .route("/s/:token/list", get(api::handlers::shares::list_share))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
