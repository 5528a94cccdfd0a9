use admission::{
    config::AdmissionConfig,
    error::{AdmissionError, Result},
    rate_limit::{AdmissionDecider, Category, CounterStore, LocalDamper, QuotaTable},
    server::{app, AppState},
};
use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use axum::{body::Body, Router};
use http::{HeaderMap, Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const CONFIG: &str = r#"
store:
  backend: memory
quotas:
  guest:
    default: { max_attempts: 10, window_secs: 60 }
    media: { max_attempts: 2, window_secs: 60 }
  free:
    default: { max_attempts: 20, window_secs: 60 }
    media: { max_attempts: 3, window_secs: 60 }
  premium:
    default: { max_attempts: 50, window_secs: 60 }
    media: { max_attempts: 5, window_secs: 60 }
damper:
  burst_threshold: 1
"#;

async fn setup_app() -> Router {
    let config = AdmissionConfig::from_yaml(CONFIG).unwrap();
    let decider = AdmissionDecider::from_config(&config).await.unwrap();
    app(AppState::new(Arc::new(decider), None))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, headers, body)
}

async fn admit(app: &Router, body: Value) -> (StatusCode, HeaderMap, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/admission")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

fn guest(ip: &str, category: &str) -> Value {
    json!({
        "identity": { "kind": "anonymous", "ip": ip },
        "category": category,
    })
}

fn user(user_id: &str, tier: &str, category: &str) -> Value {
    json!({
        "identity": { "kind": "authenticated", "user_id": user_id, "tier": tier },
        "category": category,
    })
}

#[tokio::test]
async fn test_guest_denied_after_quota() {
    let app = setup_app().await;

    for _ in 0..2 {
        let (status, _, body) = admit(&app, guest("198.51.100.1", "media")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "verdict": "allow" }));
    }

    let (status, headers, body) = admit(&app, guest("198.51.100.1", "media")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers["Retry-After"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_json_include!(
        actual: body,
        expected: json!({
            "code": "guest_rate_limited",
            "subject": "guest",
            "category": "media",
            "limit": { "max_attempts": 2, "window_secs": 60 },
        })
    );
    assert!(body.get("upgrade").is_none());

    // Other categories keep their own counters
    let (status, _, _) = admit(&app, guest("198.51.100.1", "api")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_free_user_denial_offers_upgrade() {
    let app = setup_app().await;

    for _ in 0..3 {
        let (status, _, _) = admit(&app, user("u-42", "free", "media")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _, body) = admit(&app, user("u-42", "free", "media")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_json_include!(
        actual: body,
        expected: json!({
            "code": "free_rate_limited",
            "upgrade": { "max_attempts": 5, "window_secs": 60 },
        })
    );
}

#[tokio::test]
async fn test_unknown_tier_uses_free_quota() {
    let app = setup_app().await;

    for _ in 0..3 {
        let (status, _, _) = admit(&app, user("u-7", "platinum", "media")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, _) = admit(&app, user("u-7", "platinum", "media")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_internal_and_elevated_callers_bypass() {
    let app = setup_app().await;

    for _ in 0..10 {
        let mut body = guest("10.0.0.9", "media");
        body["internal"] = json!(true);
        let (status, _, _) = admit(&app, body).await;
        assert_eq!(status, StatusCode::OK);

        let mut body = user("admin-1", "free", "media");
        body["elevated"] = json!(true);
        let (status, _, _) = admit(&app, body).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_missing_category_uses_default() {
    let app = setup_app().await;
    let body = json!({ "identity": { "kind": "anonymous", "ip": "192.0.2.1" } });

    for _ in 0..10 {
        let (status, _, _) = admit(&app, body.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, body) = admit(&app, body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["category"], "default");
}

#[tokio::test]
async fn test_category_with_separator_is_rejected() {
    let app = setup_app().await;

    let (status, _, body) = admit(&app, guest("x", "media:user")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    // The counter of a user whose id looks like a guest key stays untouched
    for _ in 0..3 {
        let (status, _, _) = admit(&app, user("guest:x", "free", "media")).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_flush_resets_counters() {
    let app = setup_app().await;

    for _ in 0..3 {
        admit(&app, guest("203.0.113.5", "media")).await;
    }
    admit(&app, user("u-1", "premium", "media")).await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/counters?prefix=ratelimit:media:")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);

    let (status, _, _) = admit(&app, guest("203.0.113.5", "media")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_flush_rejects_foreign_prefix() {
    let app = setup_app().await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/counters?prefix=ratelimit_stats:")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hourly_stats_endpoint() {
    let app = setup_app().await;

    let request = Request::builder()
        .uri("/admin/stats/2026-10-19/07")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({ "date": "2026-10-19", "hour": 7, "count": 0 })
    );

    let request = Request::builder()
        .uri("/admin/stats/2026-10-19/25")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_metrics_routes() {
    let app = setup_app().await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["degraded"], false);

    // No exporter installed for this app
    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

struct UnreachableStore;

#[async_trait]
impl CounterStore for UnreachableStore {
    async fn increment_and_get_count(&self, _key: &str, _window_secs: u64) -> Result<i64> {
        Err(AdmissionError::StoreUnavailable("connection refused".to_string()))
    }

    async fn remaining_ttl(&self, _key: &str) -> Result<u64> {
        Err(AdmissionError::StoreUnavailable("connection refused".to_string()))
    }

    async fn delete_by_prefix(&self, _prefix: &str) -> Result<u64> {
        Err(AdmissionError::StoreUnavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_store_outage_fails_open_except_fail_closed_categories() {
    let decider = AdmissionDecider::new(
        Arc::new(QuotaTable::default()),
        Arc::new(LocalDamper::disabled()),
        Arc::new(UnreachableStore),
    )
    .with_fail_closed([Category::new("media")]);
    let app = app(AppState::new(Arc::new(decider), None));

    for _ in 0..50 {
        let (status, _, _) = admit(&app, guest("198.51.100.77", "api")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, _) = admit(&app, guest("198.51.100.77", "media")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers["Retry-After"], "60");

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (_, _, body) = send(&app, request).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["degraded_episodes"], 1);

    // Admin operations surface the outage instead of hiding it
    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/counters")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
