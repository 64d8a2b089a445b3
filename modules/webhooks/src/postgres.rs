use crate::error::{WebhookError, WebhookResult};
use crate::models::{DeliveryStatus, WebhookDeadLetter, WebhookDeliveryAttempt, WebhookSubscription};
use crate::repo::WebhookRepo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: Uuid,
    webhook_id: Uuid,
    event_id: String,
    tenant_id: String,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    attempt_no: i32,
    next_run_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for WebhookDeliveryAttempt {
    type Error = WebhookError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::parse(&row.status).ok_or_else(|| WebhookError::InvalidState {
            id: row.id.to_string(),
            status: row.status.clone(),
            expected: "a known delivery status".to_string(),
        })?;

        Ok(WebhookDeliveryAttempt {
            id: row.id,
            webhook_id: row.webhook_id,
            event_id: row.event_id,
            tenant_id: row.tenant_id,
            event_type: row.event_type,
            payload: row.payload,
            status,
            attempt_no: row.attempt_no.max(0) as u32,
            next_run_at: row.next_run_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: String,
    url: String,
    secret: String,
    enabled: bool,
    event_types: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for WebhookSubscription {
    fn from(row: SubscriptionRow) -> Self {
        WebhookSubscription {
            id: row.id,
            tenant_id: row.tenant_id,
            url: row.url,
            secret: row.secret,
            enabled: row.enabled,
            event_types: row.event_types,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    attempt_id: Uuid,
    webhook_id: Uuid,
    event_id: String,
    tenant_id: String,
    event_type: String,
    payload: Vec<u8>,
    reason: String,
    attempt_no: i32,
    failed_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for WebhookDeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        WebhookDeadLetter {
            attempt_id: row.attempt_id,
            webhook_id: row.webhook_id,
            event_id: row.event_id,
            tenant_id: row.tenant_id,
            event_type: row.event_type,
            payload: row.payload,
            reason: row.reason,
            attempt_no: row.attempt_no.max(0) as u32,
            failed_at: row.failed_at,
        }
    }
}

const ATTEMPT_COLUMNS: &str = "id, webhook_id, event_id, tenant_id, event_type, payload, status, \
     attempt_no, next_run_at, last_error, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, tenant_id, url, secret, enabled, event_types, created_at, updated_at";

#[derive(Clone)]
pub struct PgWebhookRepo {
    pool: PgPool,
}

impl PgWebhookRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Turn a zero-row update into NotFound or InvalidState
    async fn explain_miss(&self, id: Uuid, expected: &str) -> WebhookError {
        match self.get_attempt(id).await {
            Ok(Some(attempt)) => WebhookError::InvalidState {
                id: id.to_string(),
                status: attempt.status.to_string(),
                expected: expected.to_string(),
            },
            Ok(None) => WebhookError::AttemptNotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl WebhookRepo for PgWebhookRepo {
    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> WebhookResult<()> {
        if subscription.url.trim().is_empty() {
            return Err(WebhookError::Invalid("url cannot be empty".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions
                (id, tenant_id, url, secret, enabled, event_types, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.tenant_id)
        .bind(&subscription.url)
        .bind(&subscription.secret)
        .bind(subscription.enabled)
        .bind(&subscription.event_types)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>> {
        let sql = format!(
            "SELECT {} FROM webhook_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn subscriptions_for(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> WebhookResult<Vec<WebhookSubscription>> {
        // Wildcard patterns are matched in Rust so both repos agree
        let sql = format!(
            "SELECT {} FROM webhook_subscriptions WHERE tenant_id = $1 AND enabled ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(WebhookSubscription::from)
            .filter(|s| s.wants(event_type))
            .collect())
    }

    async fn create_attempt(&self, attempt: &WebhookDeliveryAttempt) -> WebhookResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_delivery_attempts
                (id, webhook_id, event_id, tenant_id, event_type, payload, status,
                 attempt_no, next_run_at, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (webhook_id, event_id) DO NOTHING
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.webhook_id)
        .bind(&attempt.event_id)
        .bind(&attempt.tenant_id)
        .bind(&attempt.event_type)
        .bind(&attempt.payload)
        .bind(attempt.status.as_str())
        .bind(attempt.attempt_no as i32)
        .bind(attempt.next_run_at)
        .bind(&attempt.last_error)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_attempt(&self, id: Uuid) -> WebhookResult<Option<WebhookDeliveryAttempt>> {
        let sql = format!(
            "SELECT {} FROM webhook_delivery_attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        );
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookDeliveryAttempt::try_from).transpose()
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> WebhookResult<Vec<WebhookDeliveryAttempt>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM webhook_delivery_attempts
            WHERE status IN ('pending', 'failed') AND next_run_at <= $1
            ORDER BY next_run_at, created_at
            LIMIT $2
            "#,
            ATTEMPT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(WebhookDeliveryAttempt::try_from).collect()
    }

    async fn mark_success(&self, id: Uuid, now: DateTime<Utc>) -> WebhookResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_delivery_attempts
            SET status = 'success', last_error = NULL, updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, "pending or failed").await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_no: u32,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_delivery_attempts
            SET status = 'failed', attempt_no = $2, next_run_at = $3, last_error = $4, updated_at = $5
            WHERE id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(id)
        .bind(attempt_no as i32)
        .bind(next_run_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, "pending or failed").await);
        }
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        attempt: &WebhookDeliveryAttempt,
        attempt_no: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE webhook_delivery_attempts
            SET status = 'dlq', attempt_no = $2, last_error = $3, updated_at = $4
            WHERE id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(attempt.id)
        .bind(attempt_no as i32)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.explain_miss(attempt.id, "pending or failed").await);
        }

        sqlx::query(
            r#"
            INSERT INTO webhook_dead_letters
                (attempt_id, webhook_id, event_id, tenant_id, event_type, payload, reason, attempt_no, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.webhook_id)
        .bind(&attempt.event_id)
        .bind(&attempt.tenant_id)
        .bind(&attempt.event_type)
        .bind(&attempt.payload)
        .bind(reason)
        .bind(attempt_no as i32)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_dead_letters(&self, tenant_id: &str) -> WebhookResult<Vec<WebhookDeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT attempt_id, webhook_id, event_id, tenant_id, event_type, payload, reason,
                   attempt_no, failed_at
            FROM webhook_dead_letters
            WHERE tenant_id = $1
            ORDER BY failed_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn replay_dead_letter(&self, attempt_id: Uuid, now: DateTime<Utc>) -> WebhookResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE webhook_delivery_attempts
            SET status = 'pending', attempt_no = 0, next_run_at = $2, last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'dlq'
            "#,
        )
        .bind(attempt_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.explain_miss(attempt_id, "dlq").await);
        }

        sqlx::query("DELETE FROM webhook_dead_letters WHERE attempt_id = $1")
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
