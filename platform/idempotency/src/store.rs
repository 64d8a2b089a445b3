use crate::error::{IdempotencyError, IdempotencyResult};
use crate::record::{IdempotencyRecord, IdempotencyStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// `(tenant_id, key)` already exists; nothing was written
    Duplicate,
}

/// Durable, authoritative idempotency records
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, tenant_id: &str, key: &str) -> IdempotencyResult<Option<IdempotencyRecord>>;

    /// Atomic insert relying on the `(tenant_id, key)` uniqueness
    async fn insert(&self, record: &IdempotencyRecord) -> IdempotencyResult<InsertOutcome>;

    /// `processing -> completed`. Completed records are never rewritten.
    async fn complete(
        &self,
        tenant_id: &str,
        key: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> IdempotencyResult<IdempotencyRecord>;

    /// Delete a record that is still processing. Returns false if there was none.
    async fn delete_processing(&self, tenant_id: &str, key: &str) -> IdempotencyResult<bool>;

    /// Delete records whose `expires_at` is before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<u64>;
}

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<(String, String), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), IdempotencyRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn id(tenant_id: &str, key: &str) -> (String, String) {
    (tenant_id.to_string(), key.to_string())
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, tenant_id: &str, key: &str) -> IdempotencyResult<Option<IdempotencyRecord>> {
        Ok(self.lock().get(&id(tenant_id, key)).cloned())
    }

    async fn insert(&self, record: &IdempotencyRecord) -> IdempotencyResult<InsertOutcome> {
        let mut records = self.lock();
        let record_id = id(&record.tenant_id, &record.key);
        if records.contains_key(&record_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.insert(record_id, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn complete(
        &self,
        tenant_id: &str,
        key: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> IdempotencyResult<IdempotencyRecord> {
        let mut records = self.lock();
        let record = records
            .get_mut(&id(tenant_id, key))
            .ok_or_else(|| IdempotencyError::NotFound { key: key.to_string() })?;

        if record.is_completed() {
            return Err(IdempotencyError::AlreadyCompleted { key: key.to_string() });
        }

        record.status = IdempotencyStatus::Completed;
        record.response = Some(response);
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn delete_processing(&self, tenant_id: &str, key: &str) -> IdempotencyResult<bool> {
        let mut records = self.lock();
        let record_id = id(tenant_id, key);
        match records.get(&record_id) {
            Some(record) if !record.is_completed() => {
                records.remove(&record_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<u64> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, r| r.expires_at >= now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(key: &str, now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::processing("t1", key, "hash", now, Duration::hours(1))
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_tenant_key() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        assert_eq!(store.insert(&record("k1", now)).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&record("k1", now)).await.unwrap(), InsertOutcome::Duplicate);

        let mut other_tenant = record("k1", now);
        other_tenant.tenant_id = "t2".to_string();
        assert_eq!(store.insert(&other_tenant).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_complete_only_once() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        store.insert(&record("k1", now)).await.unwrap();

        let done = store.complete("t1", "k1", json!({"ok": true}), now).await.unwrap();
        assert_eq!(done.status, IdempotencyStatus::Completed);

        assert!(matches!(
            store.complete("t1", "k1", json!({"ok": false}), now).await,
            Err(IdempotencyError::AlreadyCompleted { .. })
        ));
        assert!(!store.delete_processing("t1", "k1").await.unwrap());
        assert_eq!(
            store.get("t1", "k1").await.unwrap().unwrap().response,
            Some(json!({"ok": true}))
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        store.insert(&record("k1", now)).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
        assert_eq!(store.purge_expired(now + Duration::hours(2)).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
