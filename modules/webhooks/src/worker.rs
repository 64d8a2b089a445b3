//! Delivers pending webhook attempts to tenant endpoints.
//!
//! Same shape as the outbox dispatcher: a fixed-interval loop over a bounded
//! batch of due rows. Each row is an independent (subscription, event) pair
//! with its own attempt counter. Retries back off exponentially with random
//! jitter so attempts that failed together do not all retry together.

use crate::error::{WebhookError, WebhookResult};
use crate::metrics::WebhookMetrics;
use crate::models::WebhookDeliveryAttempt;
use crate::repo::WebhookRepo;
use crate::signature::{sign, SIGNATURE_HEADER};
use chrono::{DateTime, Utc};
use outbox::BackoffPolicy;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const EVENT_ID_HEADER: &str = "X-Event-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

#[derive(Debug, Clone)]
pub struct WebhookWorkerConfig {
    pub poll_interval: Duration,
    pub batch_limit: usize,
    /// Failed sends after which an attempt is dead-lettered
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub http_timeout: Duration,
}

impl Default for WebhookWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_limit: 50,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            http_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub fetched: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub bookkeeping_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Retry {
        attempt_no: u32,
        next_run_at: DateTime<Utc>,
    },
    DeadLettered {
        attempt_no: u32,
    },
}

pub struct WebhookWorker {
    repo: Arc<dyn WebhookRepo>,
    client: reqwest::Client,
    config: WebhookWorkerConfig,
    backoff: BackoffPolicy,
    metrics: Option<WebhookMetrics>,
}

impl WebhookWorker {
    pub fn new(repo: Arc<dyn WebhookRepo>, config: WebhookWorkerConfig) -> WebhookResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("webhooks-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;

        Ok(Self {
            repo,
            client,
            backoff: BackoffPolicy::new(config.base_delay, config.max_delay),
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: WebhookMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &WebhookWorkerConfig {
        &self.config
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_limit = self.config.batch_limit,
            max_retries = self.config.max_retries,
            "Starting webhook worker"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let report = self.process().await;
            if report.fetched > 0 {
                tracing::info!(
                    fetched = report.fetched,
                    delivered = report.delivered,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    "Webhook batch processed"
                );
            }
        }

        tracing::info!("Webhook worker stopped");
    }

    pub async fn process(&self) -> DeliveryReport {
        self.process_at(Utc::now()).await
    }

    pub async fn process_at(&self, now: DateTime<Utc>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let attempts = match self.repo.list_due(now, self.config.batch_limit).await {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list due webhook attempts");
                report.bookkeeping_errors += 1;
                return report;
            }
        };
        report.fetched = attempts.len();

        for attempt in attempts {
            let span = tracing::info_span!(
                "webhook_deliver",
                attempt_id = %attempt.id,
                webhook_id = %attempt.webhook_id,
                event_id = %attempt.event_id,
                tenant_id = %attempt.tenant_id,
                attempt_no = attempt.attempt_no,
            );

            match self.deliver(&attempt, now).instrument(span).await {
                Ok(DeliveryOutcome::Delivered) => report.delivered += 1,
                Ok(DeliveryOutcome::Retry { .. }) => report.retried += 1,
                Ok(DeliveryOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                Err(e) => {
                    report.bookkeeping_errors += 1;
                    tracing::error!(attempt_id = %attempt.id, error = %e, "Webhook bookkeeping failed");
                }
            }
        }

        report
    }

    /// Send one attempt and record the result
    pub async fn deliver(
        &self,
        attempt: &WebhookDeliveryAttempt,
        now: DateTime<Utc>,
    ) -> WebhookResult<DeliveryOutcome> {
        let subscription = match self.repo.get_subscription(attempt.webhook_id).await? {
            Some(sub) if sub.enabled => sub,
            Some(_) => {
                return self
                    .dead_letter(attempt, attempt.attempt_no, "subscription disabled", now)
                    .await
            }
            None => {
                return self
                    .dead_letter(attempt, attempt.attempt_no, "subscription not found", now)
                    .await
            }
        };

        let signature = sign(&subscription.secret, &attempt.payload)?;
        let started = Instant::now();
        let sent = self
            .client
            .post(&subscription.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TENANT_HEADER, &attempt.tenant_id)
            .header(EVENT_ID_HEADER, &attempt.event_id)
            .header(EVENT_TYPE_HEADER, &attempt.event_type)
            .header(SIGNATURE_HEADER, signature)
            .body(attempt.payload.clone())
            .send()
            .await;

        let error = match sent {
            Ok(response) if response.status().is_success() => {
                let elapsed = started.elapsed().as_secs_f64();
                self.repo.mark_success(attempt.id, now).await?;
                if let Some(metrics) = &self.metrics {
                    metrics
                        .delivery_duration_seconds
                        .with_label_values(&[attempt.tenant_id.as_str()])
                        .observe(elapsed);
                    metrics.deliveries_total.with_label_values(&["success"]).inc();
                }
                tracing::info!(status = response.status().as_u16(), elapsed_s = elapsed, "Webhook delivered");
                return Ok(DeliveryOutcome::Delivered);
            }
            Ok(response) => format!("HTTP {}", response.status().as_u16()),
            Err(e) => e.to_string(),
        };

        self.handle_failure(attempt, &error, now).await
    }

    /// Reschedule with backoff and jitter, or dead-letter at the ceiling
    pub async fn handle_failure(
        &self,
        attempt: &WebhookDeliveryAttempt,
        error: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<DeliveryOutcome> {
        let attempt_no = attempt.attempt_no.saturating_add(1);

        if attempt_no >= self.config.max_retries {
            return self.dead_letter(attempt, attempt_no, error, now).await;
        }

        let delay = self.retry_delay(attempt_no);
        let next_run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.repo
            .mark_failed(attempt.id, attempt_no, next_run_at, error, now)
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.deliveries_total.with_label_values(&["retry"]).inc();
        }
        tracing::warn!(
            attempt_no,
            next_run_at = %next_run_at,
            error = %error,
            "Webhook delivery failed, rescheduled"
        );

        Ok(DeliveryOutcome::Retry {
            attempt_no,
            next_run_at,
        })
    }

    /// `min(base * 2^attempt_no, max)` plus uniform jitter up to half of it
    pub fn retry_delay(&self, attempt_no: u32) -> Duration {
        let delay = self.backoff.delay(attempt_no);
        let half_ms = (delay.as_millis() / 2).min(u64::MAX as u128) as u64;
        if half_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=half_ms);
        delay.saturating_add(Duration::from_millis(jitter))
    }

    async fn dead_letter(
        &self,
        attempt: &WebhookDeliveryAttempt,
        attempt_no: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<DeliveryOutcome> {
        self.repo.move_to_dlq(attempt, attempt_no, reason, now).await?;

        if let Some(metrics) = &self.metrics {
            metrics.deliveries_total.with_label_values(&["dlq"]).inc();
        }
        tracing::error!(attempt_no, reason = %reason, "Webhook attempt moved to DLQ");

        Ok(DeliveryOutcome::DeadLettered { attempt_no })
    }
}
