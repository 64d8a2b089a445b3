//! Event relay service.
//!
//! Producers write events to the outbox (directly or through
//! `POST /api/events`); the dispatcher publishes them to the bus; the router
//! fans them out to tenant webhook subscriptions; the webhook worker delivers
//! them.

pub mod bus;
pub mod config;
pub mod db;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod retention;
pub mod routes;

pub use config::{BusType, Config};
pub use metrics::RelayMetrics;
pub use pipeline::{start_pipeline, Components, PipelineHandle, StartupError};
pub use routes::{router, AppState};
