//! Durable request-level idempotency for the API ingress.
//!
//! The hash cache answers the common repeat cheaply; the store stays the
//! source of truth. A cache hit never skips the conflict check for a
//! different body, because a mismatching hash always falls through to the
//! store.

use crate::cache::HashCache;
use crate::error::{IdempotencyError, IdempotencyResult};
use crate::record::{request_hash, IdempotencyRecord};
use crate::store::{IdempotencyStore, InsertOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyConfig {
    /// How long a request hash stays in the fast cache
    pub cache_ttl: Duration,
    /// How long a durable record is kept before `purge_expired` removes it
    pub record_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            record_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginOutcome {
    pub record: IdempotencyRecord,
    /// True when this `(tenant, key, body)` was seen before
    pub already_exists: bool,
}

pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    cache: Arc<dyn HashCache>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        cache: Arc<dyn HashCache>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Claim `(tenant_id, key)` for the request `body`.
    ///
    /// Returns `already_exists = false` exactly once per key: for the caller
    /// that created the `processing` record. Every later caller with the same
    /// body gets the existing record; a different body is a
    /// [`IdempotencyError::KeyReuse`].
    pub async fn begin(
        &self,
        tenant_id: &str,
        key: &str,
        body: &[u8],
    ) -> IdempotencyResult<BeginOutcome> {
        if tenant_id.trim().is_empty() {
            return Err(IdempotencyError::Invalid("tenant_id is required".to_string()));
        }
        if key.trim().is_empty() {
            return Err(IdempotencyError::Invalid("idempotency key is empty".to_string()));
        }

        let hash = request_hash(body);
        let now = Utc::now();

        if self.cache.get(tenant_id, key).as_deref() == Some(hash.as_str()) {
            let record = match self.store.get(tenant_id, key).await? {
                Some(record) => record,
                None => self.placeholder(tenant_id, key, &hash, now),
            };
            tracing::debug!(tenant_id = %tenant_id, key = %key, "Idempotency cache hit");
            return Ok(BeginOutcome {
                record,
                already_exists: true,
            });
        }

        if let Some(existing) = self.store.get(tenant_id, key).await? {
            return Self::compare(existing, &hash);
        }

        let record = self.placeholder(tenant_id, key, &hash, now);
        match self.store.insert(&record).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                // Lost the race to a concurrent first request
                let existing = self.store.get(tenant_id, key).await?.ok_or_else(|| {
                    IdempotencyError::Store(format!(
                        "record '{}' vanished after a duplicate insert",
                        key
                    ))
                })?;
                return Self::compare(existing, &hash);
            }
        }

        self.cache.put(tenant_id, key, &hash, self.config.cache_ttl);
        tracing::debug!(tenant_id = %tenant_id, key = %key, "Idempotency key claimed");

        Ok(BeginOutcome {
            record,
            already_exists: false,
        })
    }

    /// Store the response and mark the record completed
    pub async fn complete(
        &self,
        tenant_id: &str,
        key: &str,
        response: serde_json::Value,
    ) -> IdempotencyResult<IdempotencyRecord> {
        let record = self
            .store
            .complete(tenant_id, key, response, Utc::now())
            .await?;
        self.cache.evict(tenant_id, key);
        Ok(record)
    }

    /// Give up a claim whose request failed so the client may retry.
    /// Completed records are left alone.
    pub async fn release(&self, tenant_id: &str, key: &str) -> IdempotencyResult<bool> {
        let released = self.store.delete_processing(tenant_id, key).await?;
        self.cache.evict(tenant_id, key);
        if released {
            tracing::debug!(tenant_id = %tenant_id, key = %key, "Idempotency key released");
        }
        Ok(released)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<u64> {
        let purged = self.store.purge_expired(now).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }

    fn placeholder(
        &self,
        tenant_id: &str,
        key: &str,
        hash: &str,
        now: DateTime<Utc>,
    ) -> IdempotencyRecord {
        let ttl = chrono::Duration::from_std(self.config.record_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        IdempotencyRecord::processing(tenant_id, key, hash, now, ttl)
    }

    fn compare(existing: IdempotencyRecord, hash: &str) -> IdempotencyResult<BeginOutcome> {
        if existing.request_hash != hash {
            tracing::warn!(
                tenant_id = %existing.tenant_id,
                key = %existing.key,
                "Idempotency key reused with a different request body"
            );
            return Err(IdempotencyError::KeyReuse {
                tenant_id: existing.tenant_id,
                key: existing.key,
            });
        }

        Ok(BeginOutcome {
            record: existing,
            already_exists: true,
        })
    }
}
