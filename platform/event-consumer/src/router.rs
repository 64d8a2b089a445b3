//! Subject-based fan-out from the bus to in-process handlers.
//!
//! Every route is subscribed under one consumer group, so each message goes
//! to one replica. Within a replica, each subject has its own
//! [`ConcurrencyGate`]: while it is exhausted the delivery loop stops pulling
//! messages, which pushes back on the transport instead of queueing work.

use crate::context::HandlerContext;
use crate::error::{HandlerError, RouterError};
use crate::gate::{ConcurrencyGate, DEFAULT_CONCURRENCY};
use crate::handler::{EventHandler, PreHandler};
use event_bus::consumer_retry::{retry_with_backoff_if, RetryConfig};
use event_bus::{validate_envelope_fields, BusMessage, EventBus, EventEnvelope};
use futures::stream::BoxStream;
use futures::StreamExt;
use idempotency::IdempotencyTracker;
use outbox::OutboxStore;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Consumer group shared by every replica
    pub group: String,
    /// Per-subject handler limit for routes without their own
    pub default_concurrency: usize,
    /// In-process retries for retriable handler errors
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            group: "event-router".to_string(),
            default_concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

/// Per-route overrides
#[derive(Default, Clone)]
pub struct RouteOptions {
    pub concurrency: Option<usize>,
    pub pre_handler: Option<Arc<dyn PreHandler>>,
}

impl RouteOptions {
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn pre_handler(mut self, pre: Arc<dyn PreHandler>) -> Self {
        self.pre_handler = Some(pre);
        self
    }
}

struct Route {
    subject: String,
    handler: Arc<dyn EventHandler>,
    pre_handler: Option<Arc<dyn PreHandler>>,
    gate: ConcurrencyGate,
}

/// Shared by every delivery loop and handler task
#[derive(Clone)]
struct Dispatch {
    handler: Arc<dyn EventHandler>,
    outbox: Option<Arc<dyn OutboxStore>>,
    tracker: Option<Arc<IdempotencyTracker>>,
    retry: RetryConfig,
}

pub struct EventRouter {
    bus: Arc<dyn EventBus>,
    config: RouterConfig,
    routes: Vec<Route>,
    outbox: Option<Arc<dyn OutboxStore>>,
    tracker: Option<Arc<IdempotencyTracker>>,
}

impl EventRouter {
    pub fn new(bus: Arc<dyn EventBus>, config: RouterConfig) -> Self {
        Self {
            bus,
            config,
            routes: Vec::new(),
            outbox: None,
            tracker: None,
        }
    }

    /// Outbox that [`HandlerContext::emit`] writes follow-up events to
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Skip events whose id was handled recently
    pub fn with_tracker(mut self, tracker: Arc<IdempotencyTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn register(
        &mut self,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<&mut Self, RouterError> {
        self.register_with(subject, handler, RouteOptions::default())
    }

    pub fn register_with(
        &mut self,
        subject: &str,
        handler: Arc<dyn EventHandler>,
        options: RouteOptions,
    ) -> Result<&mut Self, RouterError> {
        if subject.is_empty() || subject.split('.').any(str::is_empty) {
            return Err(RouterError::InvalidSubject(subject.to_string()));
        }
        if self.routes.iter().any(|r| r.subject == subject) {
            return Err(RouterError::DuplicateRoute(subject.to_string()));
        }

        let limit = options
            .concurrency
            .unwrap_or(self.config.default_concurrency);
        self.routes.push(Route {
            subject: subject.to_string(),
            handler,
            pre_handler: options.pre_handler,
            gate: ConcurrencyGate::new(limit),
        });
        Ok(self)
    }

    pub fn subjects(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.subject.as_str()).collect()
    }

    /// Free handler slots for a subject, `None` if it has no route
    pub fn available_permits(&self, subject: &str) -> Option<usize> {
        self.routes
            .iter()
            .find(|r| r.subject == subject)
            .map(|r| r.gate.available())
    }

    /// Subscribe every route, then spawn one delivery loop per subject.
    ///
    /// Fails without spawning anything if any subscription fails.
    pub async fn start(&self, cancel: CancellationToken) -> Result<RouterHandle, RouterError> {
        if self.routes.is_empty() {
            return Err(RouterError::NoRoutes);
        }

        let mut streams = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let stream = self
                .bus
                .queue_subscribe(&route.subject, &self.config.group)
                .await
                .map_err(|source| RouterError::Subscribe {
                    subject: route.subject.clone(),
                    source,
                })?;
            streams.push(stream);
        }

        let mut tasks = Vec::with_capacity(self.routes.len());
        for (route, stream) in self.routes.iter().zip(streams) {
            let dispatch = Dispatch {
                handler: route.handler.clone(),
                outbox: self.outbox.clone(),
                tracker: self.tracker.clone(),
                retry: self.config.retry.clone(),
            };

            tracing::info!(
                subject = %route.subject,
                group = %self.config.group,
                concurrency = route.gate.limit(),
                "Event route started"
            );

            tasks.push(tokio::spawn(delivery_loop(
                route.subject.clone(),
                stream,
                route.pre_handler.clone(),
                route.gate.clone(),
                dispatch,
                cancel.clone(),
            )));
        }

        Ok(RouterHandle { tasks })
    }
}

/// Running delivery loops of a started router
#[derive(Debug)]
pub struct RouterHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// Wait for every loop (and its in-flight handlers) to finish after the
    /// cancellation token fired or the bus closed.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Event route task panicked");
            }
        }
    }
}

async fn delivery_loop(
    subject: String,
    mut stream: BoxStream<'static, BusMessage>,
    pre_handler: Option<Arc<dyn PreHandler>>,
    gate: ConcurrencyGate,
    dispatch: Dispatch,
    cancel: CancellationToken,
) {
    let mut in_flight = JoinSet::new();

    loop {
        while in_flight.try_join_next().is_some() {}

        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = stream.next() => match msg {
                Some(msg) => msg,
                None => {
                    tracing::warn!(subject = %subject, "Subscription closed");
                    break;
                }
            },
        };

        let envelope = match decode(&msg) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(subject = %msg.subject, error = %e, "Skipping malformed envelope");
                continue;
            }
        };

        if let Some(pre) = &pre_handler {
            if let Err(e) = pre.check(&envelope).await {
                tracing::warn!(
                    event_id = %envelope.id,
                    subject = %envelope.subject,
                    tenant_id = %envelope.tenant_id,
                    error = %e,
                    "Pre-handler rejected event"
                );
                continue;
            }
        }

        let Some(permit) = gate.acquire(&cancel).await else {
            break;
        };

        let span = tracing::info_span!(
            "handle_event",
            event_id = %envelope.id,
            subject = %envelope.subject,
            tenant_id = %envelope.tenant_id,
            correlation_id = %envelope.correlation_id.as_deref().unwrap_or("none"),
        );
        let dispatch = dispatch.clone();
        in_flight.spawn(
            async move {
                dispatch.run(envelope).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    while in_flight.join_next().await.is_some() {}
    tracing::info!(subject = %subject, "Event route stopped");
}

fn decode(msg: &BusMessage) -> Result<EventEnvelope, String> {
    let value: serde_json::Value =
        serde_json::from_slice(&msg.payload).map_err(|e| format!("invalid JSON: {}", e))?;
    validate_envelope_fields(&value)?;
    serde_json::from_value(value).map_err(|e| format!("invalid envelope: {}", e))
}

impl Dispatch {
    async fn run(&self, envelope: EventEnvelope) {
        let event_id = envelope.id.clone();

        if let Some(tracker) = &self.tracker {
            if tracker.seen_before(&event_id) {
                tracing::debug!("Event already handled, skipping");
                return;
            }
        }

        let ctx = HandlerContext::new(envelope, self.outbox.clone());
        let result = retry_with_backoff_if(
            || {
                let handler = self.handler.clone();
                let ctx = ctx.for_attempt();
                async move { handler.handle(ctx).await }
            },
            &self.retry,
            ctx.subject(),
            HandlerError::is_retriable,
        )
        .await;

        match result {
            Ok(()) => tracing::info!("Event handled"),
            Err(e) => {
                if let Some(tracker) = &self.tracker {
                    tracker.forget(&event_id);
                }
                tracing::error!(error = %e, "Event handler failed, event dropped");
            }
        }
    }
}
