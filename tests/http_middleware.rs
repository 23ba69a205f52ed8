//! End-to-end tests of the admission layer in front of an axum router.

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{header::RETRY_AFTER, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower::{service_fn, Layer, Service, ServiceExt};

use tollgate::http::{AdmissionLayer, RATELIMIT_LIMIT, RATELIMIT_REMAINING};
use tollgate::ratelimit::{
    AdmissionGate, EntityType, MemoryCounterStore, MockClock, Policy, PolicyCache,
    PolicyResolver, Principal, StaticPolicyStore,
};

const T0: i64 = 1_700_000_040;

fn gate(clock: Arc<MockClock>) -> Arc<AdmissionGate> {
    let policies = StaticPolicyStore::new(vec![
        Policy::try_new(EntityType::Ip, "POST /api/v1/auth/login", 5, 60).unwrap(),
        Policy::try_new(EntityType::User, "/api/users/*", 3, 60).unwrap(),
        Policy::try_new(EntityType::User, "/api/users/profile", 1, 60).unwrap(),
    ]);
    let cache = Arc::new(PolicyCache::new(Arc::new(policies), Duration::from_secs(5)));
    Arc::new(
        AdmissionGate::new(PolicyResolver::new(cache), Arc::new(MemoryCounterStore::new()))
            .with_clock(clock),
    )
}

/// Stand-in for an authentication layer: takes the principal from test
/// headers.
async fn identify(mut request: Request, next: Next) -> Response {
    let principal = if let Some(user) = request.headers().get("x-test-user") {
        user.to_str().ok().map(Principal::user)
    } else {
        request
            .headers()
            .get("x-test-ip")
            .and_then(|v| v.to_str().ok())
            .map(Principal::ip)
    };
    if let Some(principal) = principal {
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

fn app(gate: Arc<AdmissionGate>) -> Router {
    Router::new()
        .route("/api/v1/auth/login", post(|| async { "welcome" }))
        .route("/api/users/profile", get(|| async { "profile" }))
        .route("/api/users/settings", get(|| async { "settings" }))
        .layer(AdmissionLayer::new(gate))
        .layer(middleware::from_fn(identify))
}

fn login() -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/auth/login")
        .header("x-test-ip", "203.0.113.7")
        .body(Body::empty())
        .unwrap()
}

fn user_get(path: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(path)
        .header("x-test-user", "u-42")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn login_scenario_over_http() {
    let clock = Arc::new(MockClock::at_secs(T0));
    let app = app(gate(clock.clone()));

    for expected in ["4", "3", "2", "1", "0"] {
        clock.advance(Duration::from_secs(2));
        let response = app.clone().oneshot(login()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[RATELIMIT_REMAINING], expected);
    }

    let response = app.clone().oneshot(login()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[RETRY_AFTER], "50");
    assert_eq!(response.headers()[RATELIMIT_REMAINING], "0");

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");

    // Next window
    clock.advance(Duration::from_secs(50));
    let response = app.oneshot(login()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[RATELIMIT_REMAINING], "4");
}

#[tokio::test]
async fn exact_policy_beats_wildcard() {
    let clock = Arc::new(MockClock::at_secs(T0));
    let app = app(gate(clock));

    let response = app.clone().oneshot(user_get("/api/users/profile")).await.unwrap();
    assert_eq!(response.headers()[RATELIMIT_LIMIT], "1");

    let response = app.clone().oneshot(user_get("/api/users/profile")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // The wildcard policy counts its own endpoint separately
    let response = app.oneshot(user_get("/api/users/settings")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[RATELIMIT_LIMIT], "3");
    assert_eq!(response.headers()[RATELIMIT_REMAINING], "2");
}

#[tokio::test]
async fn request_without_principal_passes_through() {
    let clock = Arc::new(MockClock::at_secs(T0));
    let app = app(gate(clock));

    for _ in 0..10 {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/auth/login")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(RATELIMIT_LIMIT).is_none());
    }
}

#[tokio::test]
async fn unmatched_endpoint_has_no_headers() {
    let clock = Arc::new(MockClock::at_secs(T0));
    let app = app(gate(clock));

    // No policy for IP principals on this route
    let request = axum::http::Request::builder()
        .uri("/api/users/settings")
        .header("x-test-ip", "203.0.113.7")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(RATELIMIT_LIMIT).is_none());
}

#[tokio::test]
async fn backpressured_inner_service_is_called_on_the_ready_instance() {
    let clock = Arc::new(MockClock::at_secs(T0));
    let inner = ConcurrencyLimitLayer::new(1).layer(service_fn(|_request: Request| async {
        Ok::<_, Infallible>(Response::new(Body::from("welcome")))
    }));
    let mut svc = AdmissionLayer::new(gate(clock)).layer(inner);

    let mut statuses = Vec::new();
    for _ in 0..6 {
        let mut request = login();
        request
            .extensions_mut()
            .insert(Principal::ip("203.0.113.7"));
        let response = svc.ready().await.unwrap().call(request).await.unwrap();
        statuses.push(response.status());
    }
    assert_eq!(statuses[..5], [StatusCode::OK; 5]);
    assert_eq!(statuses[5], StatusCode::TOO_MANY_REQUESTS);

    // A denial must not leak the reserved concurrency slot
    let response = svc.ready().await.unwrap().call(login()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
