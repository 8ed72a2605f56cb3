use crate::api::error::AppError;
use crate::api::handlers::request_meta;
use crate::entities::{prelude::*, users};
use crate::services::forensic::Severity;
use crate::utils::auth::create_jwt;
use crate::utils::validation::check_ip_rate_limit;
use argon2::{password_hash::PasswordHash, Argon2, PasswordVerifier};
use axum::{extract::State, http::HeaderMap, Json};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const LOGIN_MAX_ATTEMPTS: u64 = 10;
const LOGIN_WINDOW_MINUTES: i64 = 15;

/// Valid argon2id hash of a throwaway password. Verified against on
/// unknown usernames so both failure branches cost one full hash.
const DUMMY_PASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$VE0e3g7DalWHgDwou3nuRA$uC6TER156UQpk0lNQ5+jHM0l5poVjPA1he8TZbuA+ss";

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
}

#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 429, description = "Too many attempts")
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let meta = request_meta(&headers);

    if let Some(ip) = &meta.ip {
        if !check_ip_rate_limit(
            &state.db,
            ip,
            "login_failed",
            LOGIN_MAX_ATTEMPTS,
            LOGIN_WINDOW_MINUTES,
        )
        .await
        {
            state.forensic.log_security_event(
                "login_rate_limited",
                Severity::High,
                &meta,
                None,
                format!("Login rate limit hit for {}", ip),
                None,
            );
            return Err(AppError::RateLimited(
                "Too many login attempts, try again later".to_string(),
            ));
        }
    }

    let user = Users::find()
        .filter(users::Column::Username.eq(&req.username))
        .one(&state.db)
        .await?;

    let verified = match &user {
        Some(user) => PasswordHash::new(&user.password_hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(req.password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false),
        None => {
            if let Ok(parsed) = PasswordHash::new(DUMMY_PASSWORD_HASH) {
                let _ = Argon2::default().verify_password(req.password.as_bytes(), &parsed);
            }
            false
        }
    };

    if !verified {
        state.forensic.log_security_event(
            "login_failed",
            Severity::Medium,
            &meta,
            None,
            format!("Failed login for username {:?}", req.username),
            None,
        );
        return Err(AppError::Unauthorized("Invalid credentials".to_string()));
    }

    // verified is only true when the row exists.
    let user = match user {
        Some(u) => u,
        None => return Err(AppError::Unauthorized("Invalid credentials".to_string())),
    };

    let token = create_jwt(&user.id, &state.config.jwt_secret)?;

    state.forensic.log_event(
        Some(user.id.clone()),
        "login",
        "user",
        &user.id,
        format!("User {} logged in", user.username),
        None,
    );

    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
        is_admin: user.is_admin,
    }))
}
