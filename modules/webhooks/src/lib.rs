//! Tenant webhooks: subscriptions, per-subscription delivery attempts, signed
//! HTTP delivery with backoff and jitter, and a dead-letter table.

pub mod error;
pub mod fanout;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod repo;
pub mod signature;
pub mod worker;

pub use error::{WebhookError, WebhookResult};
pub use fanout::{WebhookFanout, WebhookFanoutHandler};
pub use metrics::WebhookMetrics;
pub use models::{DeliveryStatus, WebhookDeadLetter, WebhookDeliveryAttempt, WebhookSubscription};
pub use postgres::PgWebhookRepo;
pub use repo::{InMemoryWebhookRepo, WebhookRepo};
pub use signature::{sign, verify_signature, SIGNATURE_HEADER, SIGNATURE_PREFIX};
pub use worker::{
    DeliveryOutcome, DeliveryReport, WebhookWorker, WebhookWorkerConfig, DEFAULT_MAX_RETRIES,
    EVENT_ID_HEADER, EVENT_TYPE_HEADER, TENANT_HEADER,
};
