use crate::context::HandlerContext;
use crate::error::HandlerError;
use async_trait::async_trait;
use event_bus::EventEnvelope;
use std::future::Future;
use std::sync::Arc;

/// Reacts to one delivered event. May be called more than once for the same
/// event (retries, redelivery), so the side effect must tolerate repeats.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<(), HandlerError>;
}

/// Runs before a permit is taken. An error drops the event without ever
/// reaching the handler.
#[async_trait]
pub trait PreHandler: Send + Sync {
    async fn check(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: HandlerContext) -> Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnPreHandler<F>(F);

#[async_trait]
impl<F> PreHandler for FnPreHandler<F>
where
    F: Fn(&EventEnvelope) -> Result<(), HandlerError> + Send + Sync,
{
    async fn check(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (self.0)(envelope)
    }
}

/// Wrap a synchronous check as a [`PreHandler`]
pub fn pre_handler_fn<F>(f: F) -> Arc<dyn PreHandler>
where
    F: Fn(&EventEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnPreHandler(f))
}
