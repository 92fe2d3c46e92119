//! Shared test helpers for integration tests.
//!
//! Tests never truncate: every test creates its own project and session with
//! fresh UUIDs, so suites can run in parallel against one database.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gatehouse::api::{build_router, AppState};
use gatehouse::config::{Config, StorageConfig};
use gatehouse::db::Database;
use gatehouse::rate_limit::RateLimiter;
use gatehouse::storage::{ObjectStore, S3Presigner};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tower::ServiceExt;

pub const TEST_API_KEY: &str = "test-api-key";

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Connect to the test database, applying the bundled schema once per binary.
pub async fn setup_test_db() -> Database {
    let db = Database::connect(&test_db_url(), 5)
        .await
        .expect("Failed to connect to test database");
    SCHEMA_INIT
        .get_or_init(|| async {
            db.apply_schema().await.expect("Failed to apply schema");
        })
        .await;
    db
}

pub fn test_config() -> Config {
    Config {
        api_key: Some(TEST_API_KEY.to_string()),
        signing_key: b"test-signing-key".to_vec(),
        storage: StorageConfig {
            endpoint: Some("http://localhost:9000".to_string()),
            bucket: Some("artifacts".to_string()),
            access_key: Some("test-access".to_string()),
            secret_key: Some("test-secret".to_string()),
            region: "us-east-1".to_string(),
            presign_ttl: Duration::from_secs(600),
        },
        ..Config::default()
    }
}

/// Build the router over a given config and limit.
pub async fn build_app_with(config: Config, max_requests: u32) -> (Router, Arc<AppState>) {
    let db = setup_test_db().await;
    let limiter = RateLimiter::new(Duration::from_secs(60), max_requests);
    let storage: Arc<dyn ObjectStore> = Arc::new(S3Presigner::new(config.storage.clone()));
    let state = AppState::with_parts(db, config, limiter, storage);
    (build_router(state.clone()), state)
}

/// Build an Axum test app router connected to the test database.
pub async fn build_test_app() -> (Router, Arc<AppState>) {
    build_app_with(test_config(), 10_000).await
}

// ── Request helpers ─────────────────────────────────────────────

/// Send a request and return status, headers, and parsed JSON body
/// (`null` when the body is not JSON).
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, headers, json)
}

pub async fn get(app: &Router, uri: &str, token: &str) -> (StatusCode, Value) {
    let (status, _, json) = send(app, "GET", uri, Some(token), None).await;
    (status, json)
}

pub async fn post_json(app: &Router, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
    let (status, _, json) = send(app, "POST", uri, Some(token), Some(body)).await;
    (status, json)
}

pub async fn put_json(app: &Router, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
    let (status, _, json) = send(app, "PUT", uri, Some(token), Some(body)).await;
    (status, json)
}

/// Mint a credential through the public endpoint; panics unless it succeeds.
pub async fn mint(app: &Router, scope: Value) -> String {
    let (status, _, json) = send(
        app,
        "POST",
        "/api/v1/auth/token",
        None,
        Some(json!({ "apiKey": TEST_API_KEY, "scope": scope })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "mint failed: {}", json);
    json["token"].as_str().unwrap().to_string()
}

pub async fn admin_token(app: &Router) -> String {
    mint(app, json!({ "role": "admin" })).await
}

/// A fresh project and one open session in it, plus an agent credential
/// scoped to that session.
pub struct Fixture {
    pub admin: String,
    pub project_id: String,
    pub session_id: String,
    pub agent: String,
}

pub async fn fixture(app: &Router) -> Fixture {
    let admin = admin_token(app).await;
    let (status, project) =
        post_json(app, "/api/v1/projects", &admin, json!({ "name": "fixture" })).await;
    assert_eq!(status, StatusCode::CREATED, "{}", project);
    let project_id = project["id"].as_str().unwrap().to_string();

    let (status, session) = post_json(
        app,
        &format!("/api/v1/projects/{}/sessions", project_id),
        &admin,
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", session);
    let session_id = session["id"].as_str().unwrap().to_string();

    let agent = mint(
        app,
        json!({ "role": "agent", "projectId": project_id, "sessionId": session_id }),
    )
    .await;
    Fixture {
        admin,
        project_id,
        session_id,
        agent,
    }
}
