//! Outbox storage capability and the in-memory implementation.

use crate::error::{OutboxError, OutboxResult};
use crate::metadata::{OutboxPatch, OutboxState};
use crate::record::{OutboxRecord, OutboxStatus};
use crate::shard::ShardIndex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use std::sync::Mutex;

/// Repository of outbox records.
///
/// Implementations persist bookkeeping through the envelope metadata codec
/// and rely on their own atomicity (unique ids, single-row updates).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new pending record. Fails with `Duplicate` if the id exists.
    async fn insert(&self, record: &OutboxRecord) -> OutboxResult<()>;

    /// Due records (pending or failed, next attempt reached) in insertion order
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        shard: Option<ShardIndex>,
    ) -> OutboxResult<Vec<OutboxRecord>>;

    async fn mark_dispatched(&self, id: &str, at: DateTime<Utc>) -> OutboxResult<()>;

    async fn mark_failed(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> OutboxResult<()>;

    async fn mark_dead_letter(&self, id: &str, retry_count: u32, error: &str) -> OutboxResult<()>;

    async fn get(&self, id: &str) -> OutboxResult<Option<OutboxRecord>>;

    /// Move a dead-lettered record back to pending with a fresh retry budget
    async fn replay_dead_letter(&self, id: &str) -> OutboxResult<()>;

    /// Delete dispatched records dispatched before `older_than`
    async fn prune_dispatched(&self, older_than: DateTime<Utc>) -> OutboxResult<u64>;

    async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<u64>;
}

/// Store for tests and single-process development.
///
/// Rows are kept as stored envelopes so every read goes through the same
/// metadata codec as the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<StoredRow>>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    envelope: EventEnvelope,
    resource_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl StoredRow {
    fn decode(&self) -> OutboxResult<OutboxRecord> {
        OutboxRecord::from_stored(
            self.envelope.clone(),
            self.resource_id.clone(),
            self.created_at,
        )
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in insertion order
    pub fn all(&self) -> OutboxResult<Vec<OutboxRecord>> {
        self.lock().iter().map(StoredRow::decode).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredRow>> {
        self.rows.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply a patch to one row under the lock, optionally requiring a status
    fn patch(
        &self,
        id: &str,
        patch: OutboxPatch,
        required: Option<OutboxStatus>,
    ) -> OutboxResult<()> {
        let mut rows = self.lock();
        let row = rows
            .iter_mut()
            .find(|r| r.envelope.id == id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;

        if let Some(expected) = required {
            let current = OutboxState::decode(&row.envelope.metadata)?.status;
            if current != expected {
                return Err(OutboxError::InvalidState {
                    id: id.to_string(),
                    status: current.to_string(),
                    expected: expected.to_string(),
                });
            }
        }

        patch.apply(&mut row.envelope.metadata);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let mut rows = self.lock();
        if rows.iter().any(|r| r.envelope.id == record.id) {
            return Err(OutboxError::Duplicate(record.id.clone()));
        }
        rows.push(StoredRow {
            envelope: record.to_stored(),
            resource_id: record.resource_id.clone(),
            created_at: record.created_at,
        });
        Ok(())
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        shard: Option<ShardIndex>,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = self.lock();
        let mut due = Vec::new();
        for row in rows.iter() {
            if due.len() >= limit {
                break;
            }
            if shard.is_some_and(|s| !s.owns(&row.envelope.id)) {
                continue;
            }
            let record = row.decode()?;
            if record.is_due(now) {
                due.push(record);
            }
        }
        Ok(due)
    }

    async fn mark_dispatched(&self, id: &str, at: DateTime<Utc>) -> OutboxResult<()> {
        self.patch(id, OutboxPatch::dispatched(at), None)
    }

    async fn mark_failed(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> OutboxResult<()> {
        self.patch(id, OutboxPatch::failed(retry_count, next_attempt_at, error), None)
    }

    async fn mark_dead_letter(&self, id: &str, retry_count: u32, error: &str) -> OutboxResult<()> {
        self.patch(id, OutboxPatch::dead_letter(retry_count, error), None)
    }

    async fn get(&self, id: &str) -> OutboxResult<Option<OutboxRecord>> {
        self.lock()
            .iter()
            .find(|r| r.envelope.id == id)
            .map(StoredRow::decode)
            .transpose()
    }

    async fn replay_dead_letter(&self, id: &str) -> OutboxResult<()> {
        self.patch(id, OutboxPatch::replayed(), Some(OutboxStatus::DeadLetter))
    }

    async fn prune_dispatched(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let mut rows = self.lock();
        let before = rows.len();
        let mut decode_error = None;
        rows.retain(|row| match row.decode() {
            Ok(record) => !(record.status == OutboxStatus::Dispatched
                && record.dispatched_at.is_some_and(|at| at < older_than)),
            Err(e) => {
                decode_error.get_or_insert(e);
                true
            }
        });
        if let Some(e) = decode_error {
            return Err(e);
        }
        Ok((before - rows.len()) as u64)
    }

    async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<u64> {
        let mut count = 0;
        for row in self.lock().iter() {
            if row.decode()?.status == status {
                count += 1;
            }
        }
        Ok(count)
    }
}
