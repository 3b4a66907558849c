use crate::{create_app, AppState, GatewayConfig};
use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use quota_common::ServiceId;
use quota_engine::{
    InMemoryBilling, InMemorySettings, InMemoryStore, ManualClock, PlanCatalog, QuotaConfig,
    QuotaManager, SubscriptionRecord, SubscriptionStatus,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN_TOKEN: &str = "test-admin-token";
const PEER: ([u8; 4], u16) = ([198, 51, 100, 20], 40000);

struct TestApp {
    app: Router,
    billing: Arc<InMemoryBilling>,
}

async fn create_test_app_with(config: GatewayConfig) -> TestApp {
    let billing = Arc::new(InMemoryBilling::new());
    let quota = Arc::new(QuotaManager::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(PlanCatalog::builtin()),
        billing.clone(),
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 4, 15, 12, 0, 0).unwrap(),
        )),
        QuotaConfig::default(),
    ));
    let state = AppState::new(quota, Arc::new(InMemorySettings::new()), config).await;

    TestApp {
        app: create_app(state).layer(MockConnectInfo(SocketAddr::from(PEER))),
        billing,
    }
}

async fn create_test_app() -> TestApp {
    create_test_app_with(GatewayConfig {
        admin_token: Some(ADMIN_TOKEN.to_string()),
        ..Default::default()
    })
    .await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str, host: &str) -> axum::http::request::Builder {
    Request::builder().uri(uri).header("host", host)
}

fn post_json(uri: &str, host: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("host", host)
        .header("content-type", "application/json")
}

async fn register(app: &Router, email: &str, host: &str) -> Uuid {
    let body = json!({ "email": email });
    let (status, json) = send(
        app,
        post_json("/api/v1/users", host)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    json["id"].as_str().unwrap().parse().unwrap()
}

async fn consume(app: &Router, host: &str, user_id: Option<Uuid>, amount: u64) -> (StatusCode, Value) {
    let body = json!({ "amount": amount });
    let mut builder = post_json("/api/v1/quota/consume", host)
        .header("user-agent", "test-agent/1.0")
        .header("x-forwarded-for", "203.0.113.10");
    if let Some(id) = user_id {
        builder = builder.header("x-user-id", id.to_string());
    }
    send(app, builder.body(Body::from(body.to_string())).unwrap()).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let test = create_test_app().await;
    let (status, json) = send(&test.app, get("/health", "localhost").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_plans_follow_host() {
    let test = create_test_app().await;
    let (status, json) = send(
        &test.app,
        get("/api/v1/plans", "insights.zillow.example")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["service"], "zillow");
    let plans = json["plans"].as_array().unwrap();
    assert_eq!(plans.len(), 3);
    assert_eq!(plans[0]["tier"], "free");
    assert_eq!(plans[0]["limit"], 100);
    assert_eq!(plans[1]["limit"], 2000);
}

#[tokio::test]
async fn test_user_quota_and_consumption() {
    let test = create_test_app().await;
    let host = "digest.example.com";
    let user_id = register(&test.app, "viewer@example.com", host).await;

    let (status, json) = send(
        &test.app,
        get("/api/v1/quota", host)
            .header("x-user-id", user_id.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["service"], "youtube");
    assert_eq!(json["tier"], "free");
    assert_eq!(json["limit"], 100);
    assert_eq!(json["remaining"], 100);
    assert_eq!(json["degraded"], false);

    let (status, json) = consume(&test.app, host, Some(user_id), 60).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["used"], 60);

    let (status, json) = consume(&test.app, host, Some(user_id), 41).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["code"], "QUOTA_EXCEEDED");
    assert_eq!(json["quota"]["used"], 60);
    assert_eq!(json["quota"]["remaining"], 40);
}

#[tokio::test]
async fn test_invalid_requests() {
    let test = create_test_app().await;
    let host = "digest.example.com";
    let user_id = register(&test.app, "zero@example.com", host).await;

    let (status, json) = consume(&test.app, host, Some(user_id), 0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_AMOUNT");

    let (status, json) = send(
        &test.app,
        get("/api/v1/quota", host)
            .header("x-user-id", "not-a-uuid")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    let (status, json) = consume(&test.app, host, Some(Uuid::new_v4()), 1).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "USER_NOT_FOUND");
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let test = create_test_app().await;
    register(&test.app, "dup@example.com", "digest.example.com").await;

    let body = json!({ "email": "DUP@example.com" });
    let (status, json) = send(
        &test.app,
        post_json("/api/v1/users", "digest.example.com")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "DUPLICATE_USER");

    // Same address on the other tenant is a new account.
    register(&test.app, "dup@example.com", "zillow.example.com").await;
}

#[tokio::test]
async fn test_user_cannot_cross_tenants() {
    let test = create_test_app().await;
    let user_id = register(&test.app, "yt@example.com", "digest.example.com").await;

    let (status, json) = send(
        &test.app,
        get("/api/v1/quota", "zillow.example.com")
            .header("x-user-id", user_id.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "TENANT_MISMATCH");
}

#[tokio::test]
async fn test_guest_quota_on_zillow() {
    let test = create_test_app().await;
    let host = "zillow.example.com";

    let (status, json) = send(
        &test.app,
        get("/api/v1/guest/usage", host)
            .header("user-agent", "test-agent/1.0")
            .header("x-forwarded-for", "203.0.113.10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["service"], "zillow");
    assert_eq!(json["used"], 0);
    assert_eq!(json["limit"], 100);

    let (status, _) = consume(&test.app, host, None, 30).await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = send(
        &test.app,
        get("/api/v1/guest/usage", host)
            .header("user-agent", "test-agent/1.0")
            .header("x-forwarded-for", "203.0.113.10")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(json["used"], 30);
    assert_eq!(json["remaining"], 70);
}

#[tokio::test]
async fn test_billing_outage() {
    let test = create_test_app().await;
    let host = "digest.example.com";
    let user_id = register(&test.app, "paid@example.com", host).await;
    test.billing
        .upsert(
            user_id,
            SubscriptionRecord {
                service: ServiceId::Youtube,
                price_id: "price_youtube_pro_monthly".to_string(),
                status: SubscriptionStatus::Active,
                started_at: Utc.with_ymd_and_hms(2025, 1, 20, 9, 0, 0).unwrap(),
                ends_at: None,
            },
        )
        .await;
    test.billing.set_unavailable(true);

    let (status, json) = send(
        &test.app,
        get("/api/v1/quota", host)
            .header("x-user-id", user_id.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["degraded"], true);
    assert_eq!(json["tier"], "free");

    let (status, json) = consume(&test.app, host, Some(user_id), 1).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "BILLING_UNAVAILABLE");

    test.billing.set_unavailable(false);
    let (status, json) = consume(&test.app, host, Some(user_id), 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["tier"], "pro");
    assert_eq!(json["limit"], 20000);
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let test = create_test_app().await;
    let host = "digest.example.com";
    let user_id = register(&test.app, "reset@example.com", host).await;
    consume(&test.app, host, Some(user_id), 100).await;

    let uri = format!("/api/v1/admin/users/{user_id}/reset");
    let (status, _) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri(&uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri(&uri)
            .header("x-admin-token", "wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, json) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri(&uri)
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reset"], true);

    let (status, json) = consume(&test.app, host, Some(user_id), 100).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["used"], 100);
}

#[tokio::test]
async fn test_admin_routes_disabled_without_token() {
    let test = create_test_app_with(GatewayConfig::default()).await;
    let (status, json) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/admin/guests/purge")
            .header("x-admin-token", "anything")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "ADMIN_DISABLED");
}

#[tokio::test]
async fn test_block_user() {
    let test = create_test_app().await;
    let host = "digest.example.com";
    let user_id = register(&test.app, "blocked@example.com", host).await;

    let body = json!({ "blocked": true });
    let (status, json) = send(
        &test.app,
        post_json(&format!("/api/v1/admin/users/{user_id}/block"), host)
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["is_blocked"], true);

    let (status, json) = consume(&test.app, host, Some(user_id), 1).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "USER_BLOCKED");
}

#[tokio::test]
async fn test_subscription_webhook_clears_usage() {
    let test = create_test_app().await;
    let host = "digest.example.com";
    let user_id = register(&test.app, "upgrade@example.com", host).await;
    consume(&test.app, host, Some(user_id), 90).await;

    let body = json!({ "user_id": user_id, "event": "updated" });
    let (status, json) = send(
        &test.app,
        post_json("/api/v1/webhooks/subscription", host)
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reset"], true);

    let body = json!({ "user_id": user_id, "event": "invoice_paid" });
    let (status, json) = send(
        &test.app,
        post_json("/api/v1/webhooks/subscription", host)
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reset"], false);

    let (_, json) = send(
        &test.app,
        get("/api/v1/quota", host)
            .header("x-user-id", user_id.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(json["used"], 0);
}

#[tokio::test]
async fn test_signup_can_be_disabled() {
    let test = create_test_app_with(GatewayConfig {
        admin_token: Some(ADMIN_TOKEN.to_string()),
        initial_settings: vec![("signup_enabled".to_string(), "false".to_string())],
        ..Default::default()
    })
    .await;

    let body = json!({ "email": "late@example.com" });
    let (status, json) = send(
        &test.app,
        post_json("/api/v1/users", "digest.example.com")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "SIGNUP_DISABLED");
}

#[tokio::test]
async fn test_maintenance_mode_blocks_consumption() {
    let test = create_test_app().await;
    let host = "digest.example.com";

    let body = json!({ "key": "maintenance_mode", "value": "on" });
    let (status, json) = send(
        &test.app,
        Request::builder()
            .method("PUT")
            .uri("/api/v1/admin/settings")
            .header("content-type", "application/json")
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["maintenance_mode"], true);

    let (status, json) = consume(&test.app, host, None, 1).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "MAINTENANCE");

    // Reads keep working during maintenance.
    let (status, _) = send(
        &test.app,
        get("/api/v1/quota", host).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/admin/settings/invalidate")
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["maintenance_mode"], true);
}

async fn guest_consume(app: &Router, forwarded_for: &str) -> StatusCode {
    let body = json!({ "amount": 100 });
    let request = post_json("/api/v1/quota/consume", "zillow.example.com")
        .header("user-agent", "test-agent/1.0")
        .header("x-forwarded-for", forwarded_for)
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await.0
}

#[tokio::test]
async fn test_forwarded_for_from_untrusted_peer_is_ignored() {
    let test = create_test_app().await;

    assert_eq!(guest_consume(&test.app, "10.9.9.0").await, StatusCode::OK);
    assert_eq!(
        guest_consume(&test.app, "10.9.9.1").await,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        guest_consume(&test.app, "10.9.9.2").await,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_forwarded_for_from_trusted_proxy_is_used() {
    let test = create_test_app_with(GatewayConfig {
        trusted_proxies: vec![SocketAddr::from(PEER).ip()],
        ..Default::default()
    })
    .await;

    assert_eq!(guest_consume(&test.app, "203.0.113.1").await, StatusCode::OK);
    assert_eq!(guest_consume(&test.app, "203.0.113.2").await, StatusCode::OK);
    assert_eq!(
        guest_consume(&test.app, "203.0.113.1").await,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_malformed_body_uses_error_body() {
    let test = create_test_app().await;

    let (status, json) = send(
        &test.app,
        post_json("/api/v1/quota/consume", "digest.example.com")
            .body(Body::from(r#"{"amount": -5}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(json["error"].is_string());

    let (status, json) = send(
        &test.app,
        post_json("/api/v1/webhooks/subscription", "digest.example.com")
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
}
