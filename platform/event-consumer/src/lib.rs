//! # Event Consumer
//!
//! Bus-to-handler routing for services that react to events.
//!
//! ```rust,no_run
//! use event_bus::InMemoryBus;
//! use event_consumer::{handler_fn, EventRouter, RouterConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut router = EventRouter::new(Arc::new(InMemoryBus::new()), RouterConfig::default());
//! router.register("invoice.>", handler_fn(|ctx| async move {
//!     tracing::info!(event_id = %ctx.event_id(), "invoice event");
//!     Ok(())
//! }))?;
//!
//! let cancel = CancellationToken::new();
//! let handle = router.start(cancel.clone()).await?;
//! cancel.cancel();
//! handle.join().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod gate;
pub mod handler;
pub mod router;

pub use context::HandlerContext;
pub use error::{HandlerError, RouterError};
pub use gate::{ConcurrencyGate, DEFAULT_CONCURRENCY};
pub use handler::{handler_fn, pre_handler_fn, EventHandler, PreHandler};
pub use router::{EventRouter, RouteOptions, RouterConfig, RouterHandle};
