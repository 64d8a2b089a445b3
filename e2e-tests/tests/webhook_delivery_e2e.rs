/// Outbox → router → webhook fan-out → signed HTTP delivery E2E
///
/// Starts the relay pipeline (dispatcher, router with the fan-out handler,
/// webhook worker) against in-memory stores and a loopback axum receiver.
///
/// Run with: cargo test -p e2e-tests --test webhook_delivery_e2e
mod common;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use common::{init_tracing, wait_until, TENANT};
use event_bus::{EventEnvelope, InMemoryBus};
use idempotency::IdempotencyTracker;
use outbox::{enqueue_event, InMemoryOutboxStore};
use relay_rs::{start_pipeline, Components, Config, PipelineHandle};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webhooks_rs::{
    verify_signature, DeliveryStatus, InMemoryWebhookRepo, WebhookRepo, WebhookSubscription,
    SIGNATURE_HEADER,
};

const SECRET: &str = "whsec_e2e";

// ============================================================================
// Receiver
// ============================================================================

#[derive(Clone)]
struct Receiver {
    status: Arc<AtomicU16>,
    calls: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
}

impl Receiver {
    fn calls(&self) -> Vec<(HeaderMap, Bytes)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

async fn record(State(rx): State<Receiver>, headers: HeaderMap, body: Bytes) -> StatusCode {
    rx.calls.lock().unwrap().push((headers, body));
    StatusCode::from_u16(rx.status.load(Ordering::SeqCst)).unwrap()
}

async fn spawn_receiver(status: StatusCode) -> (String, Receiver) {
    let rx = Receiver {
        status: Arc::new(AtomicU16::new(status.as_u16())),
        calls: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/hook", post(record))
        .with_state(rx.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/hook", addr), rx)
}

// ============================================================================
// Relay harness
// ============================================================================

fn relay_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("DATABASE_URL", "postgres://unused/e2e"),
        ("OUTBOX_POLL_INTERVAL_MS", "20"),
        ("WEBHOOK_POLL_INTERVAL_MS", "20"),
        ("WEBHOOK_SUBJECTS", "invoice.>"),
        ("WEBHOOK_BASE_DELAY_MS", "10"),
        ("WEBHOOK_MAX_DELAY_MS", "40"),
        ("WEBHOOK_HTTP_TIMEOUT_MS", "2000"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_source(move |key| vars.get(key).cloned()).unwrap()
}

struct Relay {
    outbox: Arc<InMemoryOutboxStore>,
    webhooks: Arc<InMemoryWebhookRepo>,
    cancel: CancellationToken,
    pipeline: PipelineHandle,
}

impl Relay {
    async fn start(config: &Config) -> Self {
        init_tracing();
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let cancel = CancellationToken::new();

        let pipeline = start_pipeline(
            config,
            Components {
                bus: Arc::new(InMemoryBus::new()),
                outbox: outbox.clone(),
                webhooks: webhooks.clone(),
                tracker: Arc::new(IdempotencyTracker::new(Duration::from_secs(60))),
                metrics: None,
            },
            cancel.clone(),
        )
        .await
        .unwrap();

        Self {
            outbox,
            webhooks,
            cancel,
            pipeline,
        }
    }

    async fn subscribe(&self, url: &str, types: &[&str]) -> WebhookSubscription {
        let sub = WebhookSubscription::new(
            TENANT,
            url,
            SECRET,
            types.iter().map(|t| t.to_string()).collect(),
        );
        self.webhooks.insert_subscription(&sub).await.unwrap();
        sub
    }

    async fn publish(&self, id: &str, subject: &str) {
        let envelope = EventEnvelope::new(subject, TENANT, json!({ "invoice_id": "inv-1", "amount": 4200 }))
            .with_id(id)
            .with_correlation_id("corr-e2e");
        enqueue_event(self.outbox.as_ref(), envelope, Some("inv-1".to_string()))
            .await
            .unwrap();
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.pipeline.join().await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_event_reaches_subscriber_signed() {
    let (url, receiver) = spawn_receiver(StatusCode::OK).await;
    let relay = Relay::start(&relay_config(&[])).await;
    relay.subscribe(&url, &["invoice.paid"]).await;

    relay.publish("evt-paid-1", "invoice.paid").await;

    let rx = &receiver;
    assert!(wait_until(Duration::from_secs(5), || async move { rx.count() == 1 }).await);

    let (headers, body) = receiver.calls().remove(0);
    let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
    assert!(verify_signature(SECRET, &body, signature));
    assert_eq!(headers["x-tenant-id"], TENANT);
    assert_eq!(headers["x-event-id"], "evt-paid-1");
    assert_eq!(headers["x-event-type"], "invoice.paid");

    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["id"], "evt-paid-1");
    assert_eq!(payload["type"], "invoice.paid");
    assert_eq!(payload["tenant_id"], TENANT);
    assert_eq!(payload["correlation_id"], "corr-e2e");
    assert_eq!(payload["data"]["amount"], 4200);

    let webhooks = relay.webhooks.clone();
    let delivered = wait_until(Duration::from_secs(2), || {
        let webhooks = webhooks.clone();
        async move {
            webhooks
                .attempts()
                .iter()
                .all(|a| a.status == DeliveryStatus::Success)
        }
    })
    .await;
    assert!(delivered);

    relay.stop().await;
}

#[tokio::test]
async fn test_unmatched_event_creates_no_attempts() {
    let (url, receiver) = spawn_receiver(StatusCode::OK).await;
    let relay = Relay::start(&relay_config(&[])).await;
    relay.subscribe(&url, &["invoice.voided"]).await;

    relay.publish("evt-paid-2", "invoice.paid").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(relay.webhooks.attempts().is_empty());
    assert_eq!(receiver.count(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_failing_endpoint_dead_letters_without_affecting_healthy_one() {
    let (good_url, good) = spawn_receiver(StatusCode::OK).await;
    let (bad_url, bad) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let relay = Relay::start(&relay_config(&[("WEBHOOK_MAX_RETRIES", "3")])).await;
    let good_sub = relay.subscribe(&good_url, &["invoice.>"]).await;
    let bad_sub = relay.subscribe(&bad_url, &["*"]).await;

    relay.publish("evt-paid-3", "invoice.paid").await;

    let webhooks = relay.webhooks.clone();
    let dead_lettered = wait_until(Duration::from_secs(10), || {
        let webhooks = webhooks.clone();
        async move { webhooks.list_dead_letters(TENANT).await.unwrap().len() == 1 }
    })
    .await;
    assert!(dead_lettered);

    assert_eq!(bad.count(), 3);
    assert_eq!(good.count(), 1);

    let attempts = relay.webhooks.attempts();
    let good_attempt = attempts.iter().find(|a| a.webhook_id == good_sub.id).unwrap();
    let bad_attempt = attempts.iter().find(|a| a.webhook_id == bad_sub.id).unwrap();
    assert_eq!(good_attempt.status, DeliveryStatus::Success);
    assert_eq!(good_attempt.attempt_no, 0);
    assert_eq!(bad_attempt.status, DeliveryStatus::Dlq);
    assert_eq!(bad_attempt.attempt_no, 3);

    let dead = relay.webhooks.list_dead_letters(TENANT).await.unwrap();
    assert_eq!(dead[0].reason, "HTTP 500");
    assert_eq!(dead[0].event_id, "evt-paid-3");

    relay.stop().await;
}
