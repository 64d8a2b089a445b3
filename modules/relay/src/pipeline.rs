//! Background tasks of one relay process: the outbox dispatcher, the event
//! router feeding webhook fan-out, and the webhook worker.

use crate::config::Config;
use crate::metrics::RelayMetrics;
use event_bus::EventBus;
use event_consumer::{EventRouter, RouterError, RouterHandle};
use idempotency::IdempotencyTracker;
use outbox::{OutboxDispatcher, OutboxStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webhooks_rs::{WebhookError, WebhookFanoutHandler, WebhookRepo, WebhookWorker};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Stores and bus the pipeline runs against
#[derive(Clone)]
pub struct Components {
    pub bus: Arc<dyn EventBus>,
    pub outbox: Arc<dyn OutboxStore>,
    pub webhooks: Arc<dyn WebhookRepo>,
    pub tracker: Arc<IdempotencyTracker>,
    pub metrics: Option<RelayMetrics>,
}

pub struct PipelineHandle {
    tasks: Vec<JoinHandle<()>>,
    router: Option<RouterHandle>,
}

impl PipelineHandle {
    /// Wait for every task to stop after `cancel` fired
    pub async fn join(self) {
        if let Some(router) = self.router {
            router.join().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Relay task panicked");
            }
        }
    }
}

/// Start every background task. Nothing is spawned if the router or the
/// webhook client cannot be set up.
pub async fn start_pipeline(
    config: &Config,
    components: Components,
    cancel: CancellationToken,
) -> Result<PipelineHandle, StartupError> {
    let mut worker = WebhookWorker::new(components.webhooks.clone(), config.webhook.clone())?;
    let mut dispatcher = OutboxDispatcher::new(
        components.outbox.clone(),
        components.bus.clone(),
        config.dispatcher.clone(),
    );
    if let Some(metrics) = &components.metrics {
        worker = worker.with_metrics(metrics.webhooks.clone());
        dispatcher = dispatcher.with_metrics(metrics.outbox.clone());
    }

    let router = if config.webhook_subjects.is_empty() {
        tracing::warn!("WEBHOOK_SUBJECTS is empty; webhook fan-out disabled");
        None
    } else {
        let fanout = Arc::new(WebhookFanoutHandler::new(components.webhooks.clone()));
        let mut router = EventRouter::new(components.bus.clone(), config.router.clone())
            .with_outbox(components.outbox.clone())
            .with_tracker(components.tracker.clone());
        for subject in &config.webhook_subjects {
            router.register(subject, fanout.clone())?;
        }
        Some(router.start(cancel.clone()).await?)
    };

    let mut tasks = Vec::with_capacity(2);

    let dispatcher_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        dispatcher.run(dispatcher_cancel).await;
    }));

    let worker_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        worker.run(worker_cancel).await;
    }));

    Ok(PipelineHandle { tasks, router })
}
