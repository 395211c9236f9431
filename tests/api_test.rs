mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use common::{producer_with, welcome};
use reliable_messaging::api::{build_router, AppState};
use reliable_messaging::messaging::{
    init_messaging_metrics, MessageProducer, ProducerConfig, SendOptions, Transport,
};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (producer, transport, _) = producer_with(ProducerConfig::default()).await;
    let app = build_router(AppState::new(producer));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["producer"]["connection_status"], "connected");

    transport.close().await.unwrap();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    init_messaging_metrics();
    let (producer, _, _) = producer_with(ProducerConfig::default()).await;
    let result = producer
        .send("default.queue", welcome("u1"), SendOptions::new())
        .await;
    assert!(result.success);
    let app = build_router(AppState::new(producer));

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("messaging_messages_published_total"));
}

#[tokio::test]
async fn test_validate_endpoint() {
    let (producer, _, _) = producer_with(ProducerConfig::default()).await;
    let app = build_router(AppState::new(producer));

    let request = |payload: Value| {
        Request::builder()
            .method("POST")
            .uri("/v1/validate")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    };

    let response = app
        .clone()
        .oneshot(request(json!({
            "type": "crm-user-sync",
            "userId": "u1",
            "email": "ana@example.com"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["family"], "crm-sync");

    let response = app
        .oneshot(request(json!({"type": "invalid-type", "userId": "u1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["field"], "type");
}
