//! # Event Envelope
//!
//! Canonical in-flight representation of a domain event.
//!
//! ## Envelope Fields
//!
//! - `id`: Unique identifier, assigned once and never changed (idempotency key for consumers)
//! - `subject`: Dot-namespaced routing key (e.g. `invoice.generated`)
//! - `tenant_id`: Multi-tenant isolation
//! - `correlation_id`: Shared by every event of one causal chain
//! - `causation_id`: Id of the event whose handler produced this one (absent on roots)
//! - `created_at`: When the event was generated
//! - `data`: Opaque event payload
//! - `metadata`: Open string map (delivery bookkeeping lives here too)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Reasons an envelope is rejected before it can be enqueued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("subject cannot be empty")]
    EmptySubject,

    #[error("tenant_id cannot be empty")]
    EmptyTenant,

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

/// Standard event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
///
/// let root = EventEnvelope::new("invoice.generated", "tenant-123", serde_json::json!({"total": 1000}))
///     .prepare()
///     .unwrap();
/// let child = root.follow_up("ledger.posted", serde_json::json!({}));
///
/// assert_eq!(child.causation_id.as_deref(), Some(root.id.as_str()));
/// assert_eq!(child.correlation_id, root.correlation_id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier
    #[serde(default)]
    pub id: String,

    /// Routing key
    pub subject: String,

    /// Tenant identifier for multi-tenant isolation
    pub tenant_id: String,

    /// Links every event of one business transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Id of the immediate parent event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// When the event was generated
    pub created_at: DateTime<Utc>,

    /// Event-specific payload
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Create a root envelope. The id is assigned by [`EventEnvelope::prepare`]
    /// unless one is supplied with [`EventEnvelope::with_id`].
    pub fn new(
        subject: impl Into<String>,
        tenant_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: String::new(),
            subject: subject.into(),
            tenant_id: tenant_id.into(),
            correlation_id: None,
            causation_id: None,
            created_at: Utc::now(),
            data,
            metadata: BTreeMap::new(),
        }
    }

    /// Use an explicit event id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the correlation id of a root event
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation id (normally done by [`EventEnvelope::follow_up`])
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build an event produced while handling `self`.
    ///
    /// The child keeps the tenant and correlation id and points its causation
    /// id at `self.id`. Metadata is not inherited.
    pub fn follow_up(&self, subject: impl Into<String>, data: serde_json::Value) -> Self {
        let correlation_id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());

        Self {
            id: String::new(),
            subject: subject.into(),
            tenant_id: self.tenant_id.clone(),
            correlation_id: Some(correlation_id),
            causation_id: Some(self.id.clone()),
            created_at: Utc::now(),
            data,
            metadata: BTreeMap::new(),
        }
    }

    /// Stable id for the `ordinal`-th follow-up on `subject` emitted while
    /// handling `self`. A retried or redelivered handler produces the same ids,
    /// so the outbox rejects the repeats instead of storing new events.
    pub fn follow_up_id(&self, subject: &str, ordinal: u32) -> String {
        let name = format!("{}\n{}\n{}", self.id, subject, ordinal);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    /// Same as `parent.follow_up(subject, data)`
    pub fn caused_by(
        parent: &EventEnvelope,
        subject: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        parent.follow_up(subject, data)
    }

    /// Validate and finalize the envelope for enqueueing.
    ///
    /// Assigns an id if none was given and defaults the correlation id of a
    /// root event to its own id. An envelope that fails here is never enqueued.
    pub fn prepare(mut self) -> Result<Self, EnvelopeError> {
        if self.subject.trim().is_empty() {
            return Err(EnvelopeError::EmptySubject);
        }
        validate_subject(&self.subject)?;

        if self.tenant_id.trim().is_empty() {
            return Err(EnvelopeError::EmptyTenant);
        }

        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }

        if self.correlation_id.is_none() {
            self.correlation_id = Some(self.id.clone());
        }

        Ok(self)
    }

    /// Serialize to the JSON bytes that travel over the bus
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }
}

/// Check that a subject is a concrete publish subject: non-empty dot
/// separated tokens, no wildcards, no whitespace.
pub fn validate_subject(subject: &str) -> Result<(), EnvelopeError> {
    let valid = subject.split('.').all(|token| {
        !token.is_empty()
            && token != "*"
            && token != ">"
            && !token.chars().any(char::is_whitespace)
    });

    if valid {
        Ok(())
    } else {
        Err(EnvelopeError::InvalidSubject(subject.to_string()))
    }
}

/// Validate the structure of an envelope received as raw JSON
///
/// # Validation Rules
///
/// - `id`, `subject`, `tenant_id`: non-empty strings
/// - `created_at`: RFC 3339 timestamp
/// - `correlation_id`, `causation_id`: string or null when present
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    for field in ["id", "subject", "tenant_id"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {}", field))?;

        if value.trim().is_empty() {
            return Err(format!("{} cannot be empty", field));
        }
    }

    let created_at = envelope
        .get("created_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid created_at")?;

    DateTime::parse_from_rfc3339(created_at)
        .map_err(|_| format!("Invalid created_at: '{}'", created_at))?;

    for field in ["correlation_id", "causation_id"] {
        if let Some(value) = envelope.get(field) {
            if !value.is_string() && !value.is_null() {
                return Err(format!("Invalid {}: must be a string or null", field));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_assigns_id_and_root_correlation() {
        let envelope = EventEnvelope::new("invoice.generated", "tenant-123", json!({"n": 1}))
            .prepare()
            .unwrap();

        assert!(!envelope.id.is_empty());
        assert_eq!(envelope.correlation_id.as_deref(), Some(envelope.id.as_str()));
        assert!(envelope.causation_id.is_none());
    }

    #[test]
    fn test_prepare_keeps_explicit_id() {
        let envelope = EventEnvelope::new("invoice.generated", "tenant-123", json!({}))
            .with_id("evt-1")
            .with_correlation_id("corr-9")
            .prepare()
            .unwrap();

        assert_eq!(envelope.id, "evt-1");
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-9"));
    }

    #[test]
    fn test_prepare_rejects_missing_fields() {
        let err = EventEnvelope::new("", "tenant-123", json!({})).prepare().unwrap_err();
        assert_eq!(err, EnvelopeError::EmptySubject);

        let err = EventEnvelope::new("invoice.generated", " ", json!({}))
            .prepare()
            .unwrap_err();
        assert_eq!(err, EnvelopeError::EmptyTenant);

        let err = EventEnvelope::new("invoice..generated", "t", json!({}))
            .prepare()
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidSubject(_)));

        let err = EventEnvelope::new("invoice.>", "t", json!({})).prepare().unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidSubject(_)));
    }

    #[test]
    fn test_follow_up_chain() {
        let root = EventEnvelope::new("subject.foo", "tenant-1", json!({}))
            .with_id("evt-1")
            .prepare()
            .unwrap();
        let child = root.follow_up("subject.bar", json!({})).prepare().unwrap();
        let grandchild = EventEnvelope::caused_by(&child, "subject.baz", json!({}))
            .prepare()
            .unwrap();

        assert_eq!(child.causation_id.as_deref(), Some("evt-1"));
        assert_eq!(child.correlation_id.as_deref(), Some("evt-1"));
        assert_eq!(child.tenant_id, "tenant-1");
        assert_eq!(grandchild.causation_id.as_deref(), Some(child.id.as_str()));
        assert_eq!(grandchild.correlation_id.as_deref(), Some("evt-1"));
    }

    #[test]
    fn test_follow_up_id_is_stable_per_parent_subject_and_ordinal() {
        let parent = EventEnvelope::new("subject.foo", "t1", json!({})).with_id("evt-1");
        let other = EventEnvelope::new("subject.foo", "t1", json!({})).with_id("evt-2");

        let id = parent.follow_up_id("subject.bar", 0);
        assert_eq!(id, parent.follow_up_id("subject.bar", 0));
        assert!(Uuid::parse_str(&id).is_ok());
        assert_ne!(id, parent.follow_up_id("subject.bar", 1));
        assert_ne!(id, parent.follow_up_id("subject.baz", 0));
        assert_ne!(id, other.follow_up_id("subject.bar", 0));
    }

    #[test]
    fn test_metadata_omitted_when_empty() {
        let envelope = EventEnvelope::new("a.b", "t", json!({})).prepare().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert!(value.get("metadata").is_none());

        let parsed = EventEnvelope::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_validate_envelope_fields_valid() {
        let envelope = json!({
            "id": "evt-1",
            "subject": "invoice.generated",
            "tenant_id": "tenant-123",
            "created_at": "2024-01-01T00:00:00Z",
            "correlation_id": "evt-1",
            "causation_id": null,
            "data": {}
        });

        assert!(validate_envelope_fields(&envelope).is_ok());
    }

    #[test]
    fn test_validate_envelope_fields_missing_tenant_id() {
        let envelope = json!({
            "id": "evt-1",
            "subject": "invoice.generated",
            "created_at": "2024-01-01T00:00:00Z"
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_bad_timestamp_and_causation() {
        let envelope = json!({
            "id": "evt-1",
            "subject": "invoice.generated",
            "tenant_id": "tenant-123",
            "created_at": "yesterday"
        });
        assert!(validate_envelope_fields(&envelope).is_err());

        let envelope = json!({
            "id": "evt-1",
            "subject": "invoice.generated",
            "tenant_id": "tenant-123",
            "created_at": "2024-01-01T00:00:00Z",
            "causation_id": 42
        });
        assert!(validate_envelope_fields(&envelope).is_err());
    }
}
