// SPDX-License-Identifier: MIT
//! Black-box tests against the REST surface: real router, real listener,
//! empty store. Nothing here reaches an AI provider.

use std::sync::Arc;

use revd::config::RevdConfig;
use revd::AppContext;

/// Boot the API on an ephemeral port and return its base URL.
async fn spawn_api() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = RevdConfig::new(Some(0), Some(dir.path().to_path_buf()), None);
    let ctx = Arc::new(AppContext::new(config).unwrap());
    let router = revd::rest::build_router(ctx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), dir)
}

#[tokio::test]
async fn health_reports_ok() {
    let (base, _dir) = spawn_api().await;
    let resp = reqwest::get(format!("{base}/api/v1/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn listing_an_empty_store_returns_no_reviews() {
    let (base, _dir) = spawn_api().await;
    let resp = reqwest::get(format!("{base}/api/v1/reviews")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["reviews"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_review_is_404_with_a_stable_code() {
    let (base, _dir) = spawn_api().await;
    let resp = reqwest::get(format!("{base}/api/v1/reviews/ghost"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "REVIEW_NOT_FOUND");
}

#[tokio::test]
async fn aborting_an_idle_review_is_404() {
    let (base, _dir) = spawn_api().await;
    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{base}/api/v1/reviews/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn unknown_mode_is_rejected_up_front() {
    let (base, _dir) = spawn_api().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/v1/reviews"))
        .json(&serde_json::json!({
            "projectPath": "/tmp/somewhere",
            "mode": "yolo"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn missing_project_path_is_rejected_up_front() {
    let (base, _dir) = spawn_api().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/v1/reviews"))
        .json(&serde_json::json!({
            "projectPath": "",
            "mode": "staged"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn event_stream_of_an_unknown_review_is_404() {
    let (base, _dir) = spawn_api().await;
    let resp = reqwest::get(format!("{base}/api/v1/reviews/ghost/events"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
