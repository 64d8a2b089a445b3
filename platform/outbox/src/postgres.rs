//! Postgres-backed outbox store.
//!
//! Rows live in `events_outbox`. The stored envelope (`payload`, JSONB)
//! carries the delivery bookkeeping in its metadata map; transitions are
//! single-statement JSONB patches so concurrent dispatchers never lose an
//! update.

use crate::error::{OutboxError, OutboxResult};
use crate::metadata::{self, OutboxPatch};
use crate::record::{OutboxRecord, OutboxStatus};
use crate::shard::{shard_key, ShardIndex};
use crate::store::OutboxStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

#[derive(Debug, FromRow)]
struct OutboxRow {
    resource_id: Option<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl OutboxRow {
    fn into_record(self) -> OutboxResult<OutboxRecord> {
        let envelope: EventEnvelope = serde_json::from_value(self.payload)
            .map_err(|e| OutboxError::Codec(e.to_string()))?;
        OutboxRecord::from_stored(envelope, self.resource_id, self.created_at)
    }
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert inside the caller's transaction, next to the domain mutation.
    /// The record only becomes visible to dispatchers once `tx` commits.
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        record: &OutboxRecord,
    ) -> OutboxResult<()> {
        insert_with(&mut **tx, record).await
    }

    async fn apply_patch(
        &self,
        id: &str,
        patch: OutboxPatch,
        required: Option<OutboxStatus>,
    ) -> OutboxResult<()> {
        let remove: Vec<String> = patch.remove.iter().map(|k| k.to_string()).collect();
        let set = serde_json::to_value(&patch.set).map_err(|e| OutboxError::Codec(e.to_string()))?;

        let sql = format!(
            r#"
            UPDATE events_outbox
            SET payload = jsonb_set(
                payload,
                '{{metadata}}',
                (COALESCE(payload->'metadata', '{{}}'::jsonb) - $2::text[]) || $3::jsonb
            )
            WHERE id = $1
              AND ($4::text IS NULL OR {status} = $4)
            "#,
            status = metadata::status_sql(),
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(&remove)
            .bind(set)
            .bind(required.map(|s| s.as_str()))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return match (required, self.get(id).await?) {
                (_, None) => Err(OutboxError::NotFound(id.to_string())),
                (Some(expected), Some(record)) => Err(OutboxError::InvalidState {
                    id: id.to_string(),
                    status: record.status.to_string(),
                    expected: expected.to_string(),
                }),
                (None, Some(_)) => Ok(()),
            };
        }

        Ok(())
    }
}

async fn insert_with<'e, E>(executor: E, record: &OutboxRecord) -> OutboxResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let payload = serde_json::to_value(record.to_stored())
        .map_err(|e| OutboxError::Codec(e.to_string()))?;

    let result = sqlx::query(
        r#"
        INSERT INTO events_outbox
            (id, subject, tenant_id, resource_id, shard_key, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&record.id)
    .bind(&record.subject)
    .bind(&record.tenant_id)
    .bind(&record.resource_id)
    .bind(shard_key(&record.id) as i64)
    .bind(payload)
    .bind(record.created_at)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(OutboxError::Duplicate(record.id.clone()));
    }

    Ok(())
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, record: &OutboxRecord) -> OutboxResult<()> {
        insert_with(&self.pool, record).await
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        shard: Option<ShardIndex>,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let sql = format!(
            r#"
            SELECT resource_id, payload, created_at
            FROM events_outbox
            WHERE {due}
              AND ($3::bigint IS NULL OR shard_key % $3 = $4)
            ORDER BY seq ASC
            LIMIT $2
            "#,
            due = metadata::due_predicate_sql("$1"),
        );

        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .bind(shard.map(|s| s.count as i64))
            .bind(shard.map(|s| s.index as i64).unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(OutboxRow::into_record).collect()
    }

    async fn mark_dispatched(&self, id: &str, at: DateTime<Utc>) -> OutboxResult<()> {
        self.apply_patch(id, OutboxPatch::dispatched(at), None).await
    }

    async fn mark_failed(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> OutboxResult<()> {
        self.apply_patch(id, OutboxPatch::failed(retry_count, next_attempt_at, error), None)
            .await
    }

    async fn mark_dead_letter(&self, id: &str, retry_count: u32, error: &str) -> OutboxResult<()> {
        self.apply_patch(id, OutboxPatch::dead_letter(retry_count, error), None)
            .await
    }

    async fn get(&self, id: &str) -> OutboxResult<Option<OutboxRecord>> {
        let row = sqlx::query_as::<_, OutboxRow>(
            "SELECT resource_id, payload, created_at FROM events_outbox WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRow::into_record).transpose()
    }

    async fn replay_dead_letter(&self, id: &str) -> OutboxResult<()> {
        self.apply_patch(id, OutboxPatch::replayed(), Some(OutboxStatus::DeadLetter))
            .await
    }

    async fn prune_dispatched(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let sql = format!(
            "DELETE FROM events_outbox WHERE {status} = $1 AND {dispatched_at} < $2",
            status = metadata::status_sql(),
            dispatched_at = metadata::dispatched_at_sql(),
        );

        let result = sqlx::query(&sql)
            .bind(OutboxStatus::Dispatched.as_str())
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM events_outbox WHERE {} = $1",
            metadata::status_sql()
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}
