#![allow(dead_code)]

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use serde_json::Value;
use sharevault::config::{AppConfig, PolicySettings};
use sharevault::entities::users;
use sharevault::infrastructure::database;
use sharevault::services::file_service::{FileService, UploadOutcome, UploadSource};
use sharevault::services::forensic::{ForensicService, RequestMeta};
use sharevault::services::notify::{NoopNotifier, Notifier, NotifyOptions};
use sharevault::services::share_service::ShareService;
use sharevault::services::storage::{LocalStorage, StorageService};
use sharevault::utils::auth::create_jwt;
use sharevault::{create_app, AppState};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test_secret";

pub struct TestApp {
    pub db: DatabaseConnection,
    pub state: AppState,
    pub app: Router,
    pub tmp: tempfile::TempDir,
}

/// Captures every outbound notification for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, subject: &str, _html_body: &str, _opts: &NotifyOptions) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        true
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with_policy(PolicySettings::default()).await
}

pub async fn spawn_app_with_policy(policy: PolicySettings) -> TestApp {
    spawn_app_with(policy, Arc::new(NoopNotifier)).await
}

pub async fn spawn_app_with_notifier(notifier: Arc<dyn Notifier>) -> TestApp {
    spawn_app_with(PolicySettings::default(), notifier).await
}

async fn spawn_app_with(policy: PolicySettings, notifier: Arc<dyn Notifier>) -> TestApp {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    database::run_migrations(&db).await.unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let config = AppConfig {
        storage_root: tmp.path().join("storage"),
        public_dir: tmp.path().join("public"),
        jwt_secret: TEST_SECRET.to_string(),
        ..AppConfig::default()
    };

    let local = LocalStorage::new(config.storage_root.clone(), config.public_dir.clone());
    local.init().await.unwrap();
    let storage: Arc<dyn StorageService> = Arc::new(local);

    let forensic = ForensicService::new(db.clone());
    let notify_opts = NotifyOptions {
        from_email: "noreply@test.local".to_string(),
        from_name: "Test".to_string(),
    };

    let file_service = Arc::new(FileService::new(
        db.clone(),
        storage.clone(),
        forensic.clone(),
        policy.clone(),
    ));
    let share_service = Arc::new(ShareService::new(
        db.clone(),
        storage.clone(),
        forensic.clone(),
        notifier,
        notify_opts,
        config.base_url.clone(),
        policy.clone(),
    ));

    let state = AppState {
        db: db.clone(),
        storage,
        forensic,
        file_service,
        share_service,
        config,
        policy,
    };
    let app = create_app(state.clone());

    TestApp {
        db,
        state,
        app,
        tmp,
    }
}

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    is_admin: bool,
    storage_quota: i64,
) -> (users::Model, String) {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string();

    let user = users::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        username: Set(username.to_string()),
        email: Set(Some(format!("{}@example.com", username))),
        password_hash: Set(hash),
        is_admin: Set(is_admin),
        storage_used: Set(0),
        storage_quota: Set(storage_quota),
        created_at: Set(Utc::now()),
    };
    let user = user.insert(db).await.unwrap();
    let token = create_jwt(&user.id, TEST_SECRET).unwrap();
    (user, token)
}

/// Runs a file through the real upload pipeline and panics on rejection.
pub async fn upload_bytes(
    app: &TestApp,
    owner_id: &str,
    name: &str,
    bytes: &[u8],
    parent_id: Option<String>,
) -> sharevault::entities::files::Model {
    let src = app.tmp.path().join(format!("src-{}", Uuid::new_v4()));
    tokio::fs::write(&src, bytes).await.unwrap();

    let outcome = app
        .state
        .file_service
        .upload(
            UploadSource::LocalFile {
                path: src,
                declared_name: name.to_string(),
            },
            owner_id.to_string(),
            parent_id,
            None,
            false,
            RequestMeta::default(),
        )
        .await
        .unwrap();

    match outcome {
        UploadOutcome::Accepted(model) => model,
        UploadOutcome::Rejected(r) => panic!("upload of {} rejected: {:?}", name, r),
    }
}

pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let response = send_raw(app, method, uri, token, body).await;
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

pub async fn send_raw(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> axum::response::Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let request = match body {
        Some(value) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

/// Hand-rolled multipart body for upload tests.
pub fn multipart_body(
    boundary: &str,
    filename: &str,
    content_type: &str,
    content: &[u8],
    extra_fields: &[(&str, &str)],
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in extra_fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            boundary, filename, content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
