//! # EventBus Abstraction
//!
//! The bus capability every delivery component talks to. Domain services never
//! publish here directly: they write to the outbox, and the outbox dispatcher
//! is the only producer. Handlers subscribe through the event router.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS (queue groups for consumers)
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//! - **NoopBus**: Accepts and logs every publish, never delivers anything
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, EventEnvelope, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let mut stream = bus.queue_subscribe("invoice.>", "billing-workers").await?;
//!
//! let envelope = EventEnvelope::new(
//!     "invoice.generated",
//!     "tenant-123",
//!     serde_json::json!({"invoice_id": "inv_1"}),
//! )
//! .prepare()?;
//! bus.publish(&envelope.subject, envelope.to_bytes()?).await?;
//!
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.subject);
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod noop_bus;

pub use envelope::{validate_envelope_fields, validate_subject, EnvelopeError, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use noop_bus::NoopBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional transport headers
    pub headers: Option<HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Add a reply-to subject
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("bus is closed")]
    Closed,
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for publish-subscribe messaging
///
/// Providers are interchangeable; nothing above this trait knows which
/// transport moves the bytes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a concrete subject
    ///
    /// # Returns
    /// * `Ok(())` if the transport accepted the message
    /// * `Err(BusError)` if publishing failed; callers treat this as transient
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern (fan-out: every
    /// subscriber sees every message)
    ///
    /// Patterns support NATS wildcards:
    /// - `*` matches a single token (e.g., `invoice.*.created`)
    /// - `>` matches one or more tokens (e.g., `invoice.>`)
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Subscribe as a member of a consumer group: each message matching the
    /// pattern is delivered to exactly one member of `group`
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Flush pending publishes and stop accepting new ones
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
