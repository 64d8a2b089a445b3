//! Two-tier idempotency.
//!
//! * [`IdempotencyTracker`]: in-process, TTL-bounded dedup of event ids for
//!   consumers. Cheap and advisory.
//! * [`IdempotencyService`]: durable `(tenant, key)` records for API writes,
//!   fronted by a volatile [`HashCache`]. The store is authoritative.

pub mod cache;
pub mod error;
pub mod ingress;
pub mod postgres;
pub mod record;
pub mod service;
pub mod store;
pub mod tracker;

pub use cache::{HashCache, InMemoryHashCache};
pub use error::{IdempotencyError, IdempotencyResult};
pub use ingress::{
    idempotency_middleware, resolve_key, IngressHeaders, StoredResponse, CAUSATION_HEADER,
    CORRELATION_HEADER, IDEMPOTENCY_KEY_HEADER, MAX_BODY_BYTES, TENANT_HEADER,
};
pub use postgres::PgIdempotencyStore;
pub use record::{request_hash, IdempotencyRecord, IdempotencyStatus};
pub use service::{BeginOutcome, IdempotencyConfig, IdempotencyService};
pub use store::{IdempotencyStore, InMemoryIdempotencyStore, InsertOutcome};
pub use tracker::IdempotencyTracker;
