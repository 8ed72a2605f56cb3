mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::*;
use sea_orm::{ActiveModelTrait, ColumnTrait, Database, EntityTrait, QueryFilter, Set};
use serde_json::json;
use sharevault::entities::{prelude::*, security_events};
use sharevault::utils::validation::{check_ip_rate_limit, validate_file_path};
use std::path::Path;
use uuid::Uuid;

#[tokio::test]
async fn test_traversal_rejected_and_contained_paths_accepted() {
    let base = Path::new("/srv/uploads");
    assert!(validate_file_path("../../etc/passwd", base).is_none());
    assert!(validate_file_path("/etc/passwd", base).is_none());

    let resolved = validate_file_path("reports/q1.pdf", base).unwrap();
    assert_eq!(resolved, Path::new("/srv/uploads/reports/q1.pdf"));
}

#[tokio::test]
async fn test_rate_limit_fails_open_on_lookup_error() {
    // A bare connection with no tables: the count query errors out and
    // the limiter answers allow.
    let broken = Database::connect("sqlite::memory:").await.unwrap();
    assert!(check_ip_rate_limit(&broken, "10.0.0.1", "login_failed", 3, 15).await);
}

async fn record_failures(app: &TestApp, ip: &str, action: &str, n: usize) {
    for _ in 0..n {
        let row = security_events::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            action: Set(action.to_string()),
            severity: Set("medium".to_string()),
            ip_address: Set(Some(ip.to_string())),
            user_agent: Set(None),
            user_id: Set(None),
            description: Set("test fixture".to_string()),
            metadata: Set(None),
            created_at: Set(Utc::now()),
        };
        row.insert(&app.db).await.unwrap();
    }
}

#[tokio::test]
async fn test_login_is_rate_limited_per_ip() {
    let app = spawn_app().await;
    create_user(&app.db, "alice", "password-1", false, 0).await;

    record_failures(&app, "203.0.113.9", "login_failed", 10).await;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/login")
        .header("Content-Type", "application/json")
        .header("X-Forwarded-For", "203.0.113.9")
        .body(axum::body::Body::from(
            json!({ "username": "alice", "password": "password-1" }).to_string(),
        ))
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.app.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different address is unaffected.
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/login")
        .header("Content-Type", "application/json")
        .header("X-Forwarded-For", "198.51.100.7")
        .body(axum::body::Body::from(
            json!({ "username": "alice", "password": "password-1" }).to_string(),
        ))
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.app.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_failed_login_leaves_security_event() {
    let app = spawn_app().await;
    create_user(&app.db, "alice", "password-1", false, 0).await;

    let (status, _) = send_json(
        &app.app,
        "POST",
        "/login",
        None,
        Some(json!({ "username": "alice", "password": "not-it" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The event insert is fire-and-forget on another task.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let events = SecurityEvents::find()
        .filter(security_events::Column::Action.eq("login_failed"))
        .all(&app.db)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_unknown_user_and_wrong_password_answer_identically() {
    let app = spawn_app().await;
    create_user(&app.db, "alice", "password-1", false, 0).await;

    let (unknown_status, unknown_body) = send_json(
        &app.app,
        "POST",
        "/login",
        None,
        Some(json!({ "username": "nobody", "password": "password-1" })),
    )
    .await;
    let (wrong_status, wrong_body) = send_json(
        &app.app,
        "POST",
        "/login",
        None,
        Some(json!({ "username": "alice", "password": "not-it" })),
    )
    .await;

    assert_eq!(unknown_status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_status, wrong_status);
    assert_eq!(unknown_body, wrong_body);
}

#[tokio::test]
async fn test_wrong_share_password_leaves_security_event() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "guarded.bin", b"guarded", None).await;

    let (status, share) = send_json(
        &app.app,
        "POST",
        "/shares",
        Some(&jwt),
        Some(json!({ "file_id": file.id, "password": "secret123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = share["token"].as_str().unwrap();

    let (status, _) = send_json(
        &app.app,
        "GET",
        &format!("/s/{}?password=wrong", token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let events = SecurityEvents::find()
        .filter(security_events::Column::Action.eq("share_password_failed"))
        .all(&app.db)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    // A missing password is not an attempt and leaves no event.
    let (status, _) = send_json(&app.app, "GET", &format!("/s/{}", token), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let events = SecurityEvents::find()
        .filter(security_events::Column::Action.eq("share_password_failed"))
        .all(&app.db)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_share_password_guessing_is_rate_limited() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "target.bin", b"target", None).await;

    let (_, share) = send_json(
        &app.app,
        "POST",
        "/shares",
        Some(&jwt),
        Some(json!({ "file_id": file.id, "password": "secret123" })),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();

    record_failures(&app, "203.0.113.9", "share_password_failed", 10).await;

    let request = axum::http::Request::builder()
        .method("GET")
        .uri(format!("/s/{}?password=guess", token))
        .header("X-Forwarded-For", "203.0.113.9")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.app.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Without a password attempt the limiter does not apply.
    let request = axum::http::Request::builder()
        .method("GET")
        .uri(format!("/s/{}", token))
        .header("X-Forwarded-For", "203.0.113.9")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.app.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
