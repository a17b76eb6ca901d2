//! Order API tests.
//!
//! Tests for:
//! - Missing or empty orderID is rejected with 400
//! - Accepted orders answer 200 and queue their side effects
//! - Requests after pool shutdown answer 503
//! - Handler panics become 500

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use fp_api::{order_router, recover_panics};
use fp_core::{
    AlwaysProcess, BreakerSettings, CircuitBreaker, OrderService, RetryPolicy, SimulatedEffects,
    WorkerPool,
};
use fp_queue::{InMemoryBroker, ReconnectingPublisher};
use fp_storage::InMemoryStore;

fn service(broker: &InMemoryBroker) -> Arc<OrderService> {
    let effects = SimulatedEffects {
        payment_delay: Duration::from_millis(1),
        notification_delay: Duration::from_millis(1),
    };
    Arc::new(OrderService::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(ReconnectingPublisher::new(
            Arc::new(broker.clone()),
            "exchange",
            "key",
        )),
        Arc::new(effects),
        Arc::new(WorkerPool::new(5, 10)),
        Arc::new(CircuitBreaker::new(BreakerSettings::default())),
        RetryPolicy::default(),
        Arc::new(AlwaysProcess),
    ))
}

async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    (status, serde_json::from_slice(&body).expect("body should be JSON"))
}

#[tokio::test]
async fn test_missing_order_id_is_bad_request() {
    let broker = InMemoryBroker::new();
    let router = order_router(service(&broker));

    let (status, body) = send(router.clone(), "POST", "/create-order").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "orderID is required" }));

    let (status, _) = send(router, "POST", "/create-order?orderID=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_order_accepted() {
    let broker = InMemoryBroker::new();
    let service = service(&broker);
    let router = order_router(service.clone());

    let (status, body) = send(router, "POST", "/create-order?orderID=ORD-42").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "message": "Order created", "orderID": "ORD-42" })
    );

    service.pool().shutdown().await;
    assert_eq!(service.pool().stats().completed, 3);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_create_order_during_shutdown_is_unavailable() {
    let broker = InMemoryBroker::new();
    let service = service(&broker);
    service.pool().shutdown().await;

    let (status, body) = send(order_router(service), "POST", "/create-order?orderID=1").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "service is shutting down");
}

#[tokio::test]
async fn test_handler_panic_becomes_500() {
    async fn boom() -> &'static str {
        panic!("handler bug")
    }
    let router = recover_panics(Router::new().route("/boom", get(boom)));

    let (status, body) = send(router, "GET", "/boom").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("Internal Server Error"));
}

#[tokio::test]
async fn test_get_is_not_allowed() {
    let broker = InMemoryBroker::new();
    let request = Request::builder()
        .method("GET")
        .uri("/create-order?orderID=1")
        .body(Body::empty())
        .unwrap();

    let response = order_router(service(&broker)).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
