use crate::health::health;
use crate::metrics::RelayMetrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use event_bus::EventEnvelope;
use idempotency::{idempotency_middleware, IdempotencyService, IngressHeaders};
use outbox::{enqueue_event, OutboxError, OutboxStore};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub outbox: Arc<dyn OutboxStore>,
    pub metrics: RelayMetrics,
}

/// Body of `POST /api/events`. Tenant, correlation and causation come from
/// the ingress headers; an `idempotency_key` field is read by the middleware.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub subject: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub resource_id: Option<String>,
}

pub fn router(state: Arc<AppState>, idempotency: Arc<IdempotencyService>) -> Router {
    let ingest = Router::new()
        .route("/api/events", post(ingest_event))
        .route_layer(middleware::from_fn_with_state(
            idempotency,
            idempotency_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(ingest)
        .layer(TraceLayer::new_for_http())
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": error, "message": message.into() })),
    )
        .into_response()
}

/// Accept an event from a producer and write it to the outbox
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Extension(ingress): Extension<IngressHeaders>,
    Json(req): Json<IngestRequest>,
) -> Response {
    let Some(tenant_id) = ingress.tenant_id else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_tenant",
            format!("{} header is required", idempotency::TENANT_HEADER),
        );
    };

    let mut envelope = EventEnvelope::new(req.subject, tenant_id, req.data);
    if let Some(correlation_id) = ingress.correlation_id {
        envelope = envelope.with_correlation_id(correlation_id);
    }
    if let Some(causation_id) = ingress.causation_id {
        envelope = envelope.with_causation_id(causation_id);
    }

    match enqueue_event(state.outbox.as_ref(), envelope, req.resource_id).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(json!({
                "event_id": record.id,
                "subject": record.subject,
                "tenant_id": record.tenant_id,
                "correlation_id": record.envelope.correlation_id,
                "status": record.status.as_str(),
            })),
        )
            .into_response(),
        Err(e @ OutboxError::Envelope(_)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_event", e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to enqueue ingested event");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics error: {e}")),
    }
}
