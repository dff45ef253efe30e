//! HTTP flow tests against the in-memory store.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use spendbot_api::{create_router, ApiConfig, AppState};
use spendbot_models::{JobId, ManualClock};
use spendbot_queue::{MemoryStore, QueueConfig, RateLimitConfig};

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<MemoryStore>,
}

fn app_with(config: ApiConfig) -> TestApp {
    let clock = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let state = AppState::new(config, QueueConfig::default(), store.clone(), clock);
    TestApp {
        router: create_router(state.clone(), None),
        state,
        store,
    }
}

fn app() -> TestApp {
    app_with(ApiConfig::default())
}

fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

async fn submit(app: &TestApp, user: &str, key: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
    send(
        app,
        request(
            Method::POST,
            "/api/jobs",
            Some(user),
            Some(json!({"type": "categorize", "idempotency_key": key, "payload": {"text": "coffee"}})),
        ),
    )
    .await
}

#[tokio::test]
async fn create_job_is_idempotent() {
    let app = app();

    let (status, _, first) = submit(&app, "u1", "k1").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = first["job_id"].as_str().unwrap().to_string();

    let (status, _, second) = submit(&app, "u1", "k1").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["job_id"], job_id.as_str());

    assert_eq!(app.state.queue.queue_len().await.unwrap(), 1);
}

#[tokio::test]
async fn create_job_validates_input() {
    let app = app();

    let body = json!({"type": "categorize", "idempotency_key": "k1"});
    let (status, _, _) = send(&app, request(Method::POST, "/api/jobs", None, Some(body))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &app,
        request(Method::POST, "/api/jobs", Some("u1"), Some(json!({"idempotency_key": "k1"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &app,
        request(Method::POST, "/api/jobs", Some("u1"), Some(json!({"type": "analysis"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(
        &app,
        request(
            Method::POST,
            "/api/jobs",
            Some("u1"),
            Some(json!({"type": "horoscope", "idempotency_key": "k1"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    assert_eq!(app.state.queue.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn create_job_rate_limits_per_user() {
    let app = app_with(ApiConfig {
        user_job_limit: RateLimitConfig::new(2, 60),
        ..ApiConfig::default()
    });

    assert_eq!(submit(&app, "u1", "a").await.0, StatusCode::ACCEPTED);
    assert_eq!(submit(&app, "u1", "b").await.0, StatusCode::ACCEPTED);

    let (status, headers, body) = submit(&app, "u1", "c").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "rate_limited");
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    // Other users keep their own budget.
    assert_eq!(submit(&app, "u2", "c").await.0, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn blank_idempotency_key_does_not_use_quota() {
    let app = app_with(ApiConfig {
        user_job_limit: RateLimitConfig::new(1, 60),
        ..ApiConfig::default()
    });

    let (status, _, body) = submit(&app, "u1", "   ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    assert_eq!(app.state.queue.queue_len().await.unwrap(), 0);

    assert_eq!(submit(&app, "u1", "k1").await.0, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn create_job_fails_fast_when_store_is_down() {
    let app = app();
    app.store.set_available(false);

    let (status, _, body) = submit(&app, "u1", "k1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "queue_unavailable");
}

#[tokio::test]
async fn job_status_is_scoped_to_owner() {
    let app = app();
    let (_, _, created) = submit(&app, "u1", "k1").await;
    let job_id = created["job_id"].as_str().unwrap();
    let uri = format!("/api/jobs/{}", job_id);

    let (status, _, body) = send(&app, request(Method::GET, &uri, Some("u1"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], job_id);
    assert_eq!(body["type"], "categorize");
    assert_eq!(body["status"], "queued");
    assert_eq!(body["attempts"], 0);

    let (status, _, _) = send(&app, request(Method::GET, &uri, Some("u2"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, request(Method::GET, "/api/jobs/missing", Some("u1"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_only_succeeds_once() {
    let app = app();
    let (_, _, created) = submit(&app, "u1", "k1").await;
    let job_id = created["job_id"].as_str().unwrap().to_string();
    let uri = format!("/api/jobs/{}", job_id);

    let (status, _, body) = send(&app, request(Method::DELETE, &uri, Some("u1"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");

    let (status, _, _) = send(&app, request(Method::DELETE, &uri, Some("u1"), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The cancelled job is skipped rather than handed to a worker.
    assert!(app.state.queue.dequeue().await.unwrap().is_none());
    let job = app
        .state
        .queue
        .get_job(&JobId::from_string(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn health_and_readiness() {
    let app = app();

    let (status, _, body) = send(&app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _, body) = send(&app, request(Method::GET, "/ready", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    app.store.set_available(false);
    let (status, _, body) = send(&app, request(Method::GET, "/ready", None, None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");
}

#[tokio::test]
async fn admin_routes_require_token() {
    let app = app_with(ApiConfig {
        admin_token: Some("s3cret".to_string()),
        ..ApiConfig::default()
    });
    submit(&app, "u1", "k1").await;

    let (status, _, _) = send(&app, request(Method::GET, "/api/admin/queue", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/admin/queue")
        .header("x-admin-token", "s3cret")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_len"], 1);
    assert_eq!(body["claimed_len"], 0);
    assert_eq!(body["dlq_len"], 0);

    let req = Request::builder()
        .uri("/api/admin/dlq?limit=5")
        .header("x-admin-token", "s3cret")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn admin_routes_absent_without_token() {
    let app = app();
    let (status, _, _) = send(&app, request(Method::GET, "/api/admin/queue", None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
