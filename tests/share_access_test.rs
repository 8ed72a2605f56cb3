mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::*;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::json;
use sharevault::entities::{download_logs, prelude::*, shares};
use std::sync::Arc;

async fn create_share_over_http(
    app: &TestApp,
    token: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    let (status, value) = send_json(&app.app, "POST", "/shares", Some(token), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "share creation failed: {}", value);
    value
}

#[tokio::test]
async fn test_unrestricted_share_stays_valid_until_revoked() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "report.bin", b"ten bytes!", None).await;

    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "never_expires": true }),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();
    let share_id = share["id"].as_str().unwrap().to_string();

    // Repeated lookups and downloads keep working.
    for round in 0..3 {
        let (status, info) =
            send_json(&app.app, "GET", &format!("/s/{}", token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["requires_password"], json!(false));
        assert_eq!(info["filename"], json!("report.bin"));

        let response = send_raw(
            &app.app,
            "GET",
            &format!("/s/{}/download", token),
            None,
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"ten bytes!");

        let row = Shares::find()
            .filter(shares::Column::Token.eq(&token))
            .one(&app.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.download_count, round + 1);
        assert!(row.is_active);
    }

    // Revocation flips the token to the uniform unavailable response.
    let (status, _) = send_json(
        &app.app,
        "POST",
        &format!("/shares/{}/deactivate", share_id),
        Some(&jwt),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&app.app, "GET", &format!("/s/{}", token), None, None).await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_password_share_flow() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "secret.bin", b"classified", None).await;

    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "password": "secret123" }),
    )
    .await;
    let token = share["token"].as_str().unwrap();
    assert_eq!(share["has_password"], json!(true));

    // No password and a wrong password are the same answer.
    let (status, body) = send_json(&app.app, "GET", &format!("/s/{}", token), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["requires_password"], json!(true));

    let (status, body) = send_json(
        &app.app,
        "GET",
        &format!("/s/{}?password=wrong", token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["requires_password"], json!(true));

    let response = send_raw(
        &app.app,
        "GET",
        &format!("/s/{}/download?password=secret123", token),
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"classified");
}

#[tokio::test]
async fn test_expired_wins_over_password() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "old.bin", b"stale", None).await;

    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "password": "secret123" }),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();

    // Force the expiry into the past.
    let row = Shares::find()
        .filter(shares::Column::Token.eq(&token))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: shares::ActiveModel = row.into();
    active.expires_at = Set(Some(Utc::now() - Duration::hours(1)));
    active.update(&app.db).await.unwrap();

    // Even with the right password the share is gone, not
    // password-gated: expiry is checked first.
    let (status, body) = send_json(
        &app.app,
        "GET",
        &format!("/s/{}?password=secret123", token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert!(body.get("requires_password").is_none());
}

#[tokio::test]
async fn test_single_download_exhausts_share() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "once.bin", b"ten bytes!", None).await;

    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "max_downloads": 1 }),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();

    let response = send_raw(
        &app.app,
        "GET",
        &format!("/s/{}/download", token),
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"ten bytes!");

    let row = Shares::find()
        .filter(shares::Column::Token.eq(&token))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.download_count, 1);
    assert!(!row.is_active);

    // The rollup on the file follows the last active share.
    let file_row = Files::find_by_id(&file.id)
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(!file_row.is_shared);

    let (status, _) = send_json(
        &app.app,
        "GET",
        &format!("/s/{}/download", token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_concurrent_downloads_never_exceed_cap() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "capped.bin", b"contended bytes", None).await;

    let cap = 2;
    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "max_downloads": cap }),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();

    let mut handles = Vec::new();
    for _ in 0..(cap + 5) {
        let router = app.app.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let response = send_raw(
                &router,
                "GET",
                &format!("/s/{}/download", token),
                None,
                None,
            )
            .await;
            response.status()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::OK {
            successes += 1;
        }
    }
    assert_eq!(successes, cap);

    let row = Shares::find()
        .filter(shares::Column::Token.eq(&token))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.download_count, cap as i32);
    assert!(!row.is_active);
}

#[tokio::test]
async fn test_revoked_and_missing_tokens_are_indistinguishable() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "quiet.bin", b"hush", None).await;

    let share = create_share_over_http(&app, &jwt, json!({ "file_id": file.id })).await;
    let token = share["token"].as_str().unwrap().to_string();
    let share_id = share["id"].as_str().unwrap().to_string();

    send_json(
        &app.app,
        "POST",
        &format!("/shares/{}/deactivate", share_id),
        Some(&jwt),
        None,
    )
    .await;

    let (revoked_status, revoked_body) =
        send_json(&app.app, "GET", &format!("/s/{}", token), None, None).await;
    let bogus = "0".repeat(64);
    let (missing_status, missing_body) =
        send_json(&app.app, "GET", &format!("/s/{}", bogus), None, None).await;

    assert_eq!(revoked_status, missing_status);
    assert_eq!(revoked_body, missing_body);
}

#[tokio::test]
async fn test_sweep_retires_expired_shares() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "temp.bin", b"temporary", None).await;

    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "expires_in_days": 1 }),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();

    let row = Shares::find()
        .filter(shares::Column::Token.eq(&token))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: shares::ActiveModel = row.into();
    active.expires_at = Set(Some(Utc::now() - Duration::minutes(5)));
    active.update(&app.db).await.unwrap();

    assert_eq!(app.state.share_service.deactivate_expired().await.unwrap(), 1);
    // Idempotent: nothing left to sweep.
    assert_eq!(app.state.share_service.deactivate_expired().await.unwrap(), 0);

    let (status, _) = send_json(&app.app, "GET", &format!("/s/{}", token), None, None).await;
    assert_eq!(status, StatusCode::GONE);

    let file_row = Files::find_by_id(&file.id)
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(!file_row.is_shared);
}

#[tokio::test]
async fn test_folder_share_lists_and_zips_children() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;

    let folder = app
        .state
        .file_service
        .create_folder(owner.id.clone(), "bundle".to_string(), None)
        .await
        .unwrap();
    upload_bytes(&app, &owner.id, "a.bin", b"first", Some(folder.id.clone())).await;
    upload_bytes(&app, &owner.id, "b.bin", b"second", Some(folder.id.clone())).await;

    let share = create_share_over_http(&app, &jwt, json!({ "file_id": folder.id })).await;
    let token = share["token"].as_str().unwrap().to_string();

    let (status, listing) =
        send_json(&app.app, "GET", &format!("/s/{}/list", token), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["folder_name"], serde_json::json!("bundle"));
    let names: Vec<&str> = listing["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"a.bin"));
    assert!(names.contains(&"b.bin"));

    let response = send_raw(
        &app.app,
        "GET",
        &format!("/s/{}/download", token),
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_type, "application/zip");
    let bytes = body_bytes(response).await;
    // Zip local file header magic.
    assert_eq!(&bytes[..4], b"PK\x03\x04");

    let row = Shares::find()
        .filter(shares::Column::Token.eq(&token))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.download_count, 1);
}

#[tokio::test]
async fn test_inline_delivery_counts_without_notice() {
    let recorder = Arc::new(RecordingNotifier::default());
    let app = spawn_app_with_notifier(recorder.clone()).await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "preview.bin", b"inline bytes", None).await;

    let share = create_share_over_http(&app, &jwt, json!({ "file_id": file.id })).await;
    let token = share["token"].as_str().unwrap().to_string();

    let response = send_raw(
        &app.app,
        "GET",
        &format!("/s/{}/inline", token),
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("inline"), "{}", disposition);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=3600"
    );
    assert_eq!(body_bytes(response).await, b"inline bytes");

    // Inline delivery consumes a download like any other.
    let row = Shares::find()
        .filter(shares::Column::Token.eq(&token))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.download_count, 1);

    // And it never notifies anyone.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(recorder.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_download_notice_goes_to_share_owner() {
    let recorder = Arc::new(RecordingNotifier::default());
    let app = spawn_app_with_notifier(recorder.clone()).await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "watched.bin", b"watched", None).await;

    let share = create_share_over_http(
        &app,
        &jwt,
        json!({ "file_id": file.id, "recipient_email": "friend@example.net" }),
    )
    .await;
    let token = share["token"].as_str().unwrap().to_string();

    // Creation mails the share link to the recipient.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    {
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "friend@example.net");
    }

    let response = send_raw(
        &app.app,
        "GET",
        &format!("/s/{}/download", token),
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_bytes(response).await;

    // The download notice goes to the owner, not back to the recipient.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let sent = recorder.sent.lock().unwrap();
    let notices: Vec<_> = sent
        .iter()
        .filter(|(_, subject)| subject.starts_with("Download notice"))
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, "alice@example.com");
}

#[tokio::test]
async fn test_download_opens_forensic_trail() {
    let app = spawn_app().await;
    let (owner, jwt) = create_user(&app.db, "alice", "password-1", false, 0).await;
    let file = upload_bytes(&app, &owner.id, "logged.bin", b"observable", None).await;

    let share = create_share_over_http(&app, &jwt, json!({ "file_id": file.id })).await;
    let token = share["token"].as_str().unwrap().to_string();

    let response = send_raw(
        &app.app,
        "GET",
        &format!("/s/{}/download", token),
        None,
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body_bytes(response).await;

    // Completion is stamped from a drop guard on another task.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let log = DownloadLogs::find()
        .filter(download_logs::Column::FileId.eq(&file.id))
        .one(&app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.bytes_sent, bytes.len() as i64);
    assert_eq!(log.http_status, Some(200));
    assert!(log.completed_at.is_some());
}
