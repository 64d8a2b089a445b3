use crate::error::HandlerError;
use event_bus::EventEnvelope;
use outbox::{enqueue_event, OutboxError, OutboxRecord, OutboxStore};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// What a handler gets for one delivery: the decoded envelope and a way to
/// emit follow-up events through the outbox.
#[derive(Clone)]
pub struct HandlerContext {
    envelope: Arc<EventEnvelope>,
    outbox: Option<Arc<dyn OutboxStore>>,
    /// Follow-ups emitted during the current handler attempt
    emitted: Arc<AtomicU32>,
}

impl HandlerContext {
    pub fn new(envelope: EventEnvelope, outbox: Option<Arc<dyn OutboxStore>>) -> Self {
        Self {
            envelope: Arc::new(envelope),
            outbox,
            emitted: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Same event and outbox with the emit ordinal reset, for the next
    /// handler attempt
    pub fn for_attempt(&self) -> Self {
        Self {
            envelope: self.envelope.clone(),
            outbox: self.outbox.clone(),
            emitted: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    pub fn event_id(&self) -> &str {
        &self.envelope.id
    }

    pub fn subject(&self) -> &str {
        &self.envelope.subject
    }

    pub fn tenant_id(&self) -> &str {
        &self.envelope.tenant_id
    }

    /// Deserialize the event payload. A payload of the wrong shape is permanent.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.envelope.data.clone())
            .map_err(|e| HandlerError::permanent(format!("invalid payload: {}", e)))
    }

    /// Write a follow-up event to the outbox. It inherits tenant and
    /// correlation id; its causation id is the current event's id.
    ///
    /// The child id is derived from the parent id, the subject and the emit
    /// order within the attempt. Emitting again on a retry or a redelivery
    /// returns the record already stored.
    pub async fn emit(
        &self,
        subject: &str,
        data: serde_json::Value,
    ) -> Result<OutboxRecord, HandlerError> {
        let store = self
            .outbox
            .as_ref()
            .ok_or_else(|| HandlerError::permanent("no outbox configured for follow-up events"))?;

        let ordinal = self.emitted.fetch_add(1, Ordering::SeqCst);
        let child_id = self.envelope.follow_up_id(subject, ordinal);
        let child = self.envelope.follow_up(subject, data).with_id(child_id);

        let record = match enqueue_event(store.as_ref(), child, None).await {
            Ok(record) => record,
            Err(OutboxError::Duplicate(id)) => {
                let existing = store.get(&id).await?.ok_or_else(|| {
                    HandlerError::retriable(format!(
                        "follow-up '{}' vanished after a duplicate insert",
                        id
                    ))
                })?;
                tracing::debug!(event_id = %id, "Follow-up already emitted");
                return Ok(existing);
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            event_id = %record.id,
            causation_id = %self.envelope.id,
            subject = %record.subject,
            "Follow-up event emitted"
        );

        Ok(record)
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("event_id", &self.envelope.id)
            .field("subject", &self.envelope.subject)
            .field("has_outbox", &self.outbox.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox::{InMemoryOutboxStore, OutboxStatus};
    use serde::Deserialize;
    use serde_json::json;

    fn root() -> EventEnvelope {
        EventEnvelope::new("subject.foo", "tenant-1", json!({"amount": 5}))
            .with_id("evt-1")
            .prepare()
            .unwrap()
    }

    #[tokio::test]
    async fn test_emit_writes_follow_up_to_outbox() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let ctx = HandlerContext::new(root(), Some(store.clone()));

        let record = ctx.emit("subject.bar", json!({"ok": true})).await.unwrap();

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.subject, "subject.bar");
        assert_eq!(stored.envelope.causation_id.as_deref(), Some("evt-1"));
        assert_eq!(stored.envelope.correlation_id.as_deref(), Some("evt-1"));
        assert_eq!(stored.tenant_id, "tenant-1");
    }

    #[tokio::test]
    async fn test_emit_again_on_next_attempt_returns_stored_record() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let ctx = HandlerContext::new(root(), Some(store.clone()));

        let first = ctx.emit("subject.bar", json!({"n": 1})).await.unwrap();
        let second = ctx.emit("subject.bar", json!({"n": 2})).await.unwrap();
        assert_ne!(first.id, second.id);

        let retry = ctx.for_attempt();
        assert_eq!(retry.emit("subject.bar", json!({"n": 1})).await.unwrap().id, first.id);
        assert_eq!(retry.emit("subject.bar", json!({"n": 2})).await.unwrap().id, second.id);
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_emit_without_outbox_is_permanent() {
        let ctx = HandlerContext::new(root(), None);
        let err = ctx.emit("subject.bar", json!({})).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_emit_rejects_wildcard_subject() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let ctx = HandlerContext::new(root(), Some(store.clone()));

        assert!(matches!(
            ctx.emit("subject.*", json!({})).await,
            Err(HandlerError::Permanent(_))
        ));
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_typed_data() {
        #[derive(Deserialize)]
        struct Payload {
            amount: u32,
        }

        let ctx = HandlerContext::new(root(), None);
        assert_eq!(ctx.data::<Payload>().unwrap().amount, 5);
        assert!(ctx.data::<Vec<String>>().is_err());
    }
}
