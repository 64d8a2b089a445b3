//! # Transactional Outbox
//!
//! Domain services never publish to the bus directly. They write an
//! [`OutboxRecord`] in the same transaction as their state change, and the
//! [`OutboxDispatcher`] publishes it afterwards. A crash between commit and
//! publish only delays delivery; it never loses the event.
//!
//! ```rust,no_run
//! use event_bus::{EventEnvelope, InMemoryBus};
//! use outbox::{enqueue_event, DispatcherConfig, InMemoryOutboxStore, OutboxDispatcher};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryOutboxStore::new());
//! let envelope = EventEnvelope::new("invoice.generated", "tenant-1", serde_json::json!({}));
//! enqueue_event(store.as_ref(), envelope, Some("inv_1".to_string())).await?;
//!
//! let dispatcher = OutboxDispatcher::new(store, Arc::new(InMemoryBus::new()), DispatcherConfig::default());
//! let report = dispatcher.process_batch().await;
//! assert_eq!(report.dispatched, 1);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod postgres;
pub mod record;
pub mod shard;
pub mod store;
pub mod tenant_tracker;

pub use backoff::{compose_delay, BackoffPolicy};
pub use dispatcher::{
    BatchReport, DispatcherConfig, FailureOutcome, OutboxDispatcher, DEAD_LETTER_CEILING,
};
pub use error::{OutboxError, OutboxResult};
pub use metadata::OutboxState;
pub use metrics::OutboxMetrics;
pub use postgres::PgOutboxStore;
pub use record::{OutboxRecord, OutboxStatus};
pub use shard::ShardIndex;
pub use store::{InMemoryOutboxStore, OutboxStore};
pub use tenant_tracker::{TenantFailureTracker, TenantPenaltyConfig};

use event_bus::EventEnvelope;

/// Validate an envelope and add it to the outbox as a pending record.
///
/// Validation happens here, synchronously: a malformed envelope is rejected
/// with [`OutboxError::Envelope`] and never stored.
pub async fn enqueue_event(
    store: &dyn OutboxStore,
    envelope: EventEnvelope,
    resource_id: Option<String>,
) -> OutboxResult<OutboxRecord> {
    let record = OutboxRecord::new(envelope.prepare()?, resource_id);
    store.insert(&record).await?;

    tracing::debug!(
        event_id = %record.id,
        subject = %record.subject,
        tenant_id = %record.tenant_id,
        "Event enqueued to outbox"
    );

    Ok(record)
}

/// Transactional variant of [`enqueue_event`] for Postgres callers
pub async fn enqueue_event_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    envelope: EventEnvelope,
    resource_id: Option<String>,
) -> OutboxResult<OutboxRecord> {
    let record = OutboxRecord::new(envelope.prepare()?, resource_id);
    PgOutboxStore::insert_in_tx(tx, &record).await?;
    Ok(record)
}
