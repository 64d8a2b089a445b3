//! Background task that moves outbox records onto the event bus.
//!
//! Every tick fetches a bounded batch of due records in insertion order and
//! publishes them one by one. A publish failure never aborts the batch: the
//! record is rescheduled with exponential backoff (plus the tenant penalty
//! when its tenant is misbehaving) or dead-lettered once it runs out of
//! retries.

use crate::backoff::{compose_delay, BackoffPolicy};
use crate::error::OutboxResult;
use crate::metrics::OutboxMetrics;
use crate::record::OutboxRecord;
use crate::shard::ShardIndex;
use crate::store::OutboxStore;
use crate::tenant_tracker::{TenantFailureTracker, TenantPenaltyConfig};
use chrono::{DateTime, Utc};
use event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Retry count at which a record stops being retried
pub const DEAD_LETTER_CEILING: u32 = 10;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_limit: usize,
    pub dead_letter_ceiling: u32,
    pub backoff: BackoffPolicy,
    pub tenant_penalty: TenantPenaltyConfig,
    pub shard: Option<ShardIndex>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_limit: 100,
            dead_letter_ceiling: DEAD_LETTER_CEILING,
            backoff: BackoffPolicy::default(),
            tenant_penalty: TenantPenaltyConfig::default(),
            shard: None,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub dispatched: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Store calls that failed (fetch or status update)
    pub bookkeeping_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered {
        retry_count: u32,
    },
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: DispatcherConfig,
    tenants: Arc<TenantFailureTracker>,
    metrics: Option<OutboxMetrics>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        config: DispatcherConfig,
    ) -> Self {
        let tenants = Arc::new(TenantFailureTracker::new(config.tenant_penalty));
        Self {
            store,
            bus,
            config,
            tenants,
            metrics: None,
        }
    }

    /// Share a failure tracker (e.g. between dispatchers of one process)
    pub fn with_tenant_tracker(mut self, tenants: Arc<TenantFailureTracker>) -> Self {
        self.tenants = tenants;
        self
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Poll until `cancel` fires. A batch that is already running is
    /// finished before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_limit = self.config.batch_limit,
            shard = ?self.config.shard,
            "Starting outbox dispatcher"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tick_count += 1;

            let report = self.process_batch().await;
            if report.fetched > 0 {
                tracing::info!(
                    tick = tick_count,
                    fetched = report.fetched,
                    dispatched = report.dispatched,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    "Outbox batch processed"
                );
            } else if tick_count % 60 == 0 {
                tracing::debug!(tick = tick_count, "No due outbox records");
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    pub async fn process_batch(&self) -> BatchReport {
        self.process_batch_at(Utc::now()).await
    }

    /// One tick evaluated at `now`
    pub async fn process_batch_at(&self, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::default();

        let records = match self
            .store
            .fetch_due(now, self.config.batch_limit, self.config.shard)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch due outbox records");
                report.bookkeeping_errors += 1;
                return report;
            }
        };
        report.fetched = records.len();

        for record in records {
            let span = tracing::info_span!(
                "outbox_dispatch",
                event_id = %record.id,
                subject = %record.subject,
                tenant_id = %record.tenant_id,
                retry_count = record.retry_count,
            );
            self.dispatch_one(&record, now, &mut report)
                .instrument(span)
                .await;
        }

        report
    }

    async fn dispatch_one(&self, record: &OutboxRecord, now: DateTime<Utc>, report: &mut BatchReport) {
        let published = match record.publish_bytes() {
            Ok(bytes) => self
                .bus
                .publish(&record.subject, bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.published_total.inc();
                }
                match self.store.mark_dispatched(&record.id, Utc::now()).await {
                    Ok(()) => {
                        report.dispatched += 1;
                        tracing::debug!("Outbox record dispatched");
                    }
                    Err(e) => {
                        // Published but still eligible: consumers see a duplicate
                        report.bookkeeping_errors += 1;
                        tracing::error!(error = %e, "Failed to mark outbox record dispatched");
                    }
                }
            }
            Err(error) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .publish_failures_total
                        .with_label_values(&[record.tenant_id.as_str()])
                        .inc();
                }
                match self.handle_failure(record, &error, now).await {
                    Ok(FailureOutcome::Retry { .. }) => report.retried += 1,
                    Ok(FailureOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                    Err(e) => {
                        report.bookkeeping_errors += 1;
                        tracing::error!(error = %e, "Failed to record outbox publish failure");
                    }
                }
            }
        }
    }

    /// Reschedule or dead-letter a record whose publish failed
    pub async fn handle_failure(
        &self,
        record: &OutboxRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> OutboxResult<FailureOutcome> {
        let retry_count = record.retry_count.saturating_add(1);
        self.tenants.record_failure(&record.tenant_id, now);

        if retry_count >= self.config.dead_letter_ceiling {
            self.store
                .mark_dead_letter(&record.id, retry_count, error)
                .await?;

            if let Some(metrics) = &self.metrics {
                metrics.dead_lettered_total.inc();
            }
            tracing::error!(
                event_id = %record.id,
                tenant_id = %record.tenant_id,
                retry_count,
                error = %error,
                "Outbox record moved to dead_letter"
            );
            return Ok(FailureOutcome::DeadLettered { retry_count });
        }

        let next_attempt_at = self.next_attempt_at(retry_count, &record.tenant_id, now);
        self.store
            .mark_failed(&record.id, retry_count, next_attempt_at, error)
            .await?;

        tracing::warn!(
            event_id = %record.id,
            tenant_id = %record.tenant_id,
            retry_count,
            next_attempt_at = %next_attempt_at,
            error = %error,
            "Outbox publish failed, rescheduled"
        );

        Ok(FailureOutcome::Retry {
            retry_count,
            next_attempt_at,
        })
    }

    /// `now + backoff(retry) + tenant penalty`
    pub fn next_attempt_at(&self, retry_count: u32, tenant_id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = compose_delay(
            self.config.backoff.delay(retry_count),
            self.tenants.penalty_for(tenant_id, now),
        );
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
