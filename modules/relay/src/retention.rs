//! Periodic cleanup of terminal rows: dispatched outbox records past their
//! retention and expired idempotency keys.

use chrono::{DateTime, Utc};
use idempotency::IdempotencyService;
use outbox::OutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub outbox_pruned: u64,
    pub idempotency_purged: u64,
}

/// One cleanup pass at `now`. Failures are logged; the other half still runs.
pub async fn run_retention(
    outbox: &dyn OutboxStore,
    idempotency: &IdempotencyService,
    outbox_retention: Duration,
    now: DateTime<Utc>,
) -> RetentionReport {
    let mut report = RetentionReport::default();

    let cutoff = chrono::Duration::from_std(outbox_retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    match outbox.prune_dispatched(cutoff).await {
        Ok(pruned) => {
            report.outbox_pruned = pruned;
            if pruned > 0 {
                tracing::info!(pruned, cutoff = %cutoff, "Pruned dispatched outbox records");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Outbox prune failed"),
    }

    match idempotency.purge_expired(now).await {
        Ok(purged) => report.idempotency_purged = purged,
        Err(e) => tracing::warn!(error = %e, "Idempotency purge failed"),
    }

    report
}

/// Run [`run_retention`] every `interval` until `cancel` fires
pub fn spawn_retention(
    outbox: Arc<dyn OutboxStore>,
    idempotency: Arc<IdempotencyService>,
    outbox_retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    run_retention(outbox.as_ref(), &idempotency, outbox_retention, Utc::now()).await;
                }
            }
        }
    })
}
