/// Outbox → bus → router → follow-up event E2E
///
/// Runs the dispatcher and the router against the in-memory bus and outbox:
/// 1. `evt-1` on `subject.foo` is enqueued to the outbox
/// 2. The dispatcher publishes it; the `subject.foo` handler emits `subject.bar`
/// 3. The dispatcher publishes the follow-up; the `subject.bar` handler sees it
/// 4. Both outbox rows end up dispatched
///
/// Run with: cargo test -p e2e-tests --test outbox_router_e2e
mod common;

use common::{init_tracing, wait_until, TENANT};
use event_bus::{EventBus, EventEnvelope, InMemoryBus};
use event_consumer::{handler_fn, EventRouter, HandlerError, RouterConfig};
use idempotency::IdempotencyTracker;
use outbox::{
    enqueue_event, DispatcherConfig, InMemoryOutboxStore, OutboxDispatcher, OutboxStatus,
    OutboxStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    bus: Arc<InMemoryBus>,
    outbox: Arc<InMemoryOutboxStore>,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        Self {
            bus: Arc::new(InMemoryBus::new()),
            outbox: Arc::new(InMemoryOutboxStore::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn router(&self) -> EventRouter {
        EventRouter::new(self.bus.clone(), RouterConfig::default()).with_outbox(self.outbox.clone())
    }

    fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = OutboxDispatcher::new(
            self.outbox.clone(),
            self.bus.clone(),
            DispatcherConfig {
                poll_interval: Duration::from_millis(20),
                ..DispatcherConfig::default()
            },
        );
        let cancel = self.cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    }

    async fn unfinished(&self) -> u64 {
        let pending = self.outbox.count_by_status(OutboxStatus::Pending).await.unwrap();
        let failed = self.outbox.count_by_status(OutboxStatus::Failed).await.unwrap();
        pending + failed
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_follow_up_event_carries_causation_and_outbox_drains() {
    let h = Harness::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();

    let mut router = h.router();
    router
        .register(
            "subject.foo",
            handler_fn(|ctx| async move {
                ctx.emit("subject.bar", json!({ "from": ctx.event_id() }))
                    .await?;
                Ok::<(), HandlerError>(())
            }),
        )
        .unwrap();
    router
        .register(
            "subject.bar",
            handler_fn(move |ctx| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ctx.envelope().clone());
                    Ok(())
                }
            }),
        )
        .unwrap();

    let routes = router.start(h.cancel.clone()).await.unwrap();
    let dispatcher = h.spawn_dispatcher();

    let root = EventEnvelope::new("subject.foo", TENANT, json!({ "n": 1 })).with_id("evt-1");
    enqueue_event(h.outbox.as_ref(), root, None).await.unwrap();

    let follow_up = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("follow-up handler not invoked")
        .expect("channel closed");

    assert_eq!(follow_up.subject, "subject.bar");
    assert_eq!(follow_up.causation_id.as_deref(), Some("evt-1"));
    assert_eq!(follow_up.correlation_id.as_deref(), Some("evt-1"));
    assert_eq!(follow_up.tenant_id, TENANT);
    assert_eq!(follow_up.data["from"], "evt-1");
    assert!(follow_up.metadata.is_empty());

    let harness = &h;
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            harness.unfinished().await == 0
        })
        .await
    );
    assert_eq!(
        h.outbox.count_by_status(OutboxStatus::Dispatched).await.unwrap(),
        2
    );

    h.cancel.cancel();
    routes.join().await;
    dispatcher.await.unwrap();
}

#[tokio::test]
async fn test_redelivered_event_handled_once() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let mut router = h
        .router()
        .with_tracker(Arc::new(IdempotencyTracker::new(Duration::from_secs(60))));
    router
        .register(
            "orders.>",
            handler_fn(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();
    let routes = router.start(h.cancel.clone()).await.unwrap();

    // at-least-once transport: the same envelope arrives twice
    let envelope = EventEnvelope::new("orders.created", TENANT, json!({}))
        .with_id("evt-dup")
        .prepare()
        .unwrap();
    let bytes = envelope.to_bytes().unwrap();
    h.bus.publish("orders.created", bytes.clone()).await.unwrap();
    h.bus.publish("orders.created", bytes).await.unwrap();

    let observed = &calls;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            observed.load(Ordering::SeqCst) >= 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.cancel.cancel();
    routes.join().await;
}

#[tokio::test]
async fn test_retriable_handler_error_recovers() {
    let h = Harness::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let seen = attempts.clone();
    let mut router = h.router();
    router
        .register(
            "billing.charge",
            handler_fn(move |ctx| {
                let seen = seen.clone();
                let tx = tx.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(HandlerError::retriable("gateway timeout"));
                    }
                    let _ = tx.send(ctx.event_id().to_string());
                    Ok(())
                }
            }),
        )
        .unwrap();
    let routes = router.start(h.cancel.clone()).await.unwrap();
    let dispatcher = h.spawn_dispatcher();

    let record = enqueue_event(
        h.outbox.as_ref(),
        EventEnvelope::new("billing.charge", TENANT, json!({ "amount": 10 })),
        Some("charge-1".to_string()),
    )
    .await
    .unwrap();

    let handled = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handled, record.id);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    h.cancel.cancel();
    routes.join().await;
    dispatcher.await.unwrap();
}
