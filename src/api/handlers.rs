use crate::api::AppState;
use crate::messaging::consumers::InboundMessage;
use crate::messaging::{
    render_metrics, ConsumerHealth, MessageProducer, ProducerHealth, ValidationFailure,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub producer: ProducerHealth,
    pub consumers: Vec<ConsumerHealth>,
}

/// Producer health plus every registered consumer; 503 when any is unhealthy
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let producer = state.producer.health().await;
    let consumers = match &state.dispatcher {
        Some(dispatcher) => dispatcher.consumer_health().await,
        None => Vec::new(),
    };

    let healthy = producer.is_healthy && consumers.iter().all(|c| c.is_healthy);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            producer,
            consumers,
        }),
    )
}

/// Process is up, regardless of broker state
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(),
    )
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ValidateResponse {
    Accepted {
        family: &'static str,
        message: InboundMessage,
    },
    Rejected(ValidationFailure),
}

/// Run a payload through the validation pipe without publishing it
pub async fn validate_message(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> (StatusCode, Json<ValidateResponse>) {
    match InboundMessage::parse(&state.pipe, &raw) {
        Ok(message) => (
            StatusCode::OK,
            Json(ValidateResponse::Accepted {
                family: message.family(),
                message,
            }),
        ),
        Err(failure) => (StatusCode::BAD_REQUEST, Json(ValidateResponse::Rejected(failure))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogSink;
    use crate::messaging::{BrokerProducer, InMemoryTransport, ProducerConfig, Transport};
    use serde_json::json;
    use std::sync::Arc;

    async fn state(connected: bool) -> AppState {
        let transport = InMemoryTransport::with_default_topology().unwrap();
        if connected {
            transport.connect().await.unwrap();
        }
        let producer = BrokerProducer::new(
            Arc::new(transport),
            ProducerConfig::default(),
            Arc::new(MemoryLogSink::new()),
        )
        .unwrap();
        AppState::new(producer)
    }

    #[tokio::test]
    async fn test_health_reflects_connection() {
        let (status, Json(body)) = health_check(State(state(true).await)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");
        assert!(body.consumers.is_empty());

        let (status, Json(body)) = health_check(State(state(false).await)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.producer.is_healthy);
    }

    #[tokio::test]
    async fn test_validate_message() {
        let state = state(true).await;

        let (status, Json(body)) = validate_message(
            State(state.clone()),
            Json(json!({"type": "user-welcome", "userId": "u1", "email": "ana@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(matches!(body, ValidateResponse::Accepted { family: "notification", .. }));

        let (status, Json(body)) = validate_message(
            State(state),
            Json(json!({"type": "user-welcome", "userId": "u1", "email": "ana@example.com", "extraField": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        match body {
            ValidateResponse::Rejected(failure) => {
                assert!(failure.has_constraint("whitelistValidation"))
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
