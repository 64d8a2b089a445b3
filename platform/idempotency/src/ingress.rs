//! API ingress: request metadata headers and the idempotency middleware.

use crate::error::IdempotencyError;
use crate::record::IdempotencyStatus;
use crate::service::IdempotencyService;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Largest request or response body the middleware will buffer
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const CAUSATION_HEADER: &str = "x-causation-id";

/// Typed request metadata, available to handlers as a request extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressHeaders {
    pub tenant_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

type Setter = fn(&mut IngressHeaders, String);

fn set_tenant(h: &mut IngressHeaders, v: String) {
    h.tenant_id = Some(v);
}

fn set_idempotency_key(h: &mut IngressHeaders, v: String) {
    h.idempotency_key = Some(v);
}

fn set_correlation(h: &mut IngressHeaders, v: String) {
    h.correlation_id = Some(v);
}

fn set_causation(h: &mut IngressHeaders, v: String) {
    h.causation_id = Some(v);
}

const HEADER_TABLE: &[(&str, Setter)] = &[
    (TENANT_HEADER, set_tenant),
    (IDEMPOTENCY_KEY_HEADER, set_idempotency_key),
    (CORRELATION_HEADER, set_correlation),
    (CAUSATION_HEADER, set_causation),
];

impl IngressHeaders {
    /// Non-UTF-8 and blank values are treated as absent
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut out = IngressHeaders::default();
        for (name, set) in HEADER_TABLE {
            let value = headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(value) = value {
                set(&mut out, value.to_string());
            }
        }
        out
    }
}

/// The idempotency key for a request: the header wins, then the body's
/// top-level `idempotency_key` string field.
pub fn resolve_key(headers: &IngressHeaders, body: &[u8]) -> Option<String> {
    if let Some(key) = &headers.idempotency_key {
        return Some(key.clone());
    }

    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("idempotency_key")?
        .as_str()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// A handler response captured so a repeat can be answered verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: String,
}

impl StoredResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = (status, self.body).into_response();
        if let Some(ct) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            response.headers_mut().insert(header::CONTENT_TYPE, ct);
        }
        response
    }
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": error, "message": message.into() })),
    )
        .into_response()
}

fn is_write(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Deduplicate write requests by `(tenant, idempotency key)`.
///
/// Requests without a key pass straight through. A repeat of a completed
/// request gets the stored response; a repeat of one still in flight gets
/// `202 {"status":"processing"}`; reusing a key for a different body is `409`.
pub async fn idempotency_middleware(
    State(service): State<Arc<IdempotencyService>>,
    request: Request,
    next: Next,
) -> Response {
    let ingress = IngressHeaders::from_headers(request.headers());

    if !is_write(request.method()) {
        return run_with_headers(request, ingress, next).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "invalid_body", e.to_string())
        }
    };

    let Some(key) = resolve_key(&ingress, &bytes) else {
        let request = Request::from_parts(parts, Body::from(bytes));
        return run_with_headers(request, ingress, next).await;
    };

    let Some(tenant_id) = ingress.tenant_id.clone() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_tenant",
            format!("{} header is required with an idempotency key", TENANT_HEADER),
        );
    };

    let outcome = match service.begin(&tenant_id, &key, &bytes).await {
        Ok(outcome) => outcome,
        Err(e @ IdempotencyError::KeyReuse { .. }) => {
            return error_response(StatusCode::CONFLICT, "idempotency_key_reuse", e.to_string())
        }
        Err(e @ IdempotencyError::Invalid(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
        }
        Err(e) => {
            tracing::error!(tenant_id = %tenant_id, key = %key, error = %e, "Idempotency check failed");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "idempotency_unavailable", e.to_string());
        }
    };

    if outcome.already_exists {
        return match outcome.record.status {
            IdempotencyStatus::Completed => replay(outcome.record.response),
            IdempotencyStatus::Processing => {
                (StatusCode::ACCEPTED, Json(json!({ "status": "processing" }))).into_response()
            }
        };
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    let response = run_with_headers(request, ingress, next).await;

    if !response.status().is_success() {
        if let Err(e) = service.release(&tenant_id, &key).await {
            tracing::warn!(tenant_id = %tenant_id, key = %key, error = %e, "Failed to release idempotency key");
        }
        return response;
    }

    let (parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(tenant_id = %tenant_id, key = %key, error = %e, "Failed to buffer response");
            if let Err(e) = service.release(&tenant_id, &key).await {
                tracing::warn!(tenant_id = %tenant_id, key = %key, error = %e, "Failed to release idempotency key");
            }
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "failed to read response");
        }
    };

    let stored = StoredResponse {
        status: parts.status.as_u16(),
        content_type: parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    match serde_json::to_value(&stored) {
        Ok(value) => {
            if let Err(e) = service.complete(&tenant_id, &key, value).await {
                tracing::warn!(tenant_id = %tenant_id, key = %key, error = %e, "Failed to complete idempotency record");
            }
        }
        Err(e) => {
            tracing::warn!(tenant_id = %tenant_id, key = %key, error = %e, "Failed to encode stored response");
        }
    }

    Response::from_parts(parts, Body::from(body))
}

async fn run_with_headers(mut request: Request, ingress: IngressHeaders, next: Next) -> Response {
    request.extensions_mut().insert(ingress);
    next.run(request).await
}

fn replay(response: Option<serde_json::Value>) -> Response {
    match response.map(serde_json::from_value::<StoredResponse>) {
        Some(Ok(stored)) => stored.into_response(),
        Some(Err(_)) | None => (StatusCode::OK, Json(json!({ "status": "completed" }))).into_response(),
    }
}
