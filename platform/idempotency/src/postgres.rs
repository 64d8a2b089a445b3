use crate::error::{IdempotencyError, IdempotencyResult};
use crate::record::{IdempotencyRecord, IdempotencyStatus};
use crate::store::{IdempotencyStore, InsertOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    tenant_id: String,
    key: String,
    request_hash: String,
    status: String,
    response: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = IdempotencyError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        let status = IdempotencyStatus::parse(&row.status)
            .ok_or_else(|| IdempotencyError::Store(format!("unknown status '{}'", row.status)))?;

        Ok(IdempotencyRecord {
            tenant_id: row.tenant_id,
            key: row.key,
            request_hash: row.request_hash,
            status,
            response: row.response,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "tenant_id, key, request_hash, status, response, created_at, updated_at, expires_at";

#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of rows for one key (used to verify the single-winner race)
    pub async fn count(&self, tenant_id: &str, key: &str) -> IdempotencyResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM idempotency_keys WHERE tenant_id = $1 AND key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn get(&self, tenant_id: &str, key: &str) -> IdempotencyResult<Option<IdempotencyRecord>> {
        let sql = format!(
            "SELECT {} FROM idempotency_keys WHERE tenant_id = $1 AND key = $2",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, IdempotencyRow>(&sql)
            .bind(tenant_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn insert(&self, record: &IdempotencyRecord) -> IdempotencyResult<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys
                (tenant_id, key, request_hash, status, response, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, key) DO NOTHING
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.key)
        .bind(&record.request_hash)
        .bind(record.status.as_str())
        .bind(&record.response)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn complete(
        &self,
        tenant_id: &str,
        key: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> IdempotencyResult<IdempotencyRecord> {
        let sql = format!(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed', response = $3, updated_at = $4
            WHERE tenant_id = $1 AND key = $2 AND status = 'processing'
            RETURNING {}
            "#,
            SELECT_COLUMNS
        );
        let updated = sqlx::query_as::<_, IdempotencyRow>(&sql)
            .bind(tenant_id)
            .bind(key)
            .bind(&response)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => row.try_into(),
            None => match self.get(tenant_id, key).await? {
                Some(_) => Err(IdempotencyError::AlreadyCompleted { key: key.to_string() }),
                None => Err(IdempotencyError::NotFound { key: key.to_string() }),
            },
        }
    }

    async fn delete_processing(&self, tenant_id: &str, key: &str) -> IdempotencyResult<bool> {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys WHERE tenant_id = $1 AND key = $2 AND status = 'processing'",
        )
        .bind(tenant_id)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
