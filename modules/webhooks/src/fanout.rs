//! Turns a routed event into one pending delivery attempt per subscription.

use crate::error::{WebhookError, WebhookResult};
use crate::models::WebhookDeliveryAttempt;
use crate::repo::WebhookRepo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use event_consumer::{EventHandler, HandlerContext, HandlerError};
use serde::Serialize;
use std::sync::Arc;

/// Body every subscriber receives. Field order is the wire order.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    tenant_id: &'a str,
    created_at: DateTime<Utc>,
    correlation_id: Option<&'a str>,
    data: &'a serde_json::Value,
}

#[derive(Clone)]
pub struct WebhookFanout {
    repo: Arc<dyn WebhookRepo>,
}

impl WebhookFanout {
    pub fn new(repo: Arc<dyn WebhookRepo>) -> Self {
        Self { repo }
    }

    pub fn payload(envelope: &EventEnvelope) -> WebhookResult<Vec<u8>> {
        let body = WebhookBody {
            id: &envelope.id,
            event_type: &envelope.subject,
            tenant_id: &envelope.tenant_id,
            created_at: envelope.created_at,
            correlation_id: envelope.correlation_id.as_deref(),
            data: &envelope.data,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Create a pending attempt for each enabled subscription that wants the
    /// event. Returns only the attempts created by this call; a redelivered
    /// event creates nothing new.
    pub async fn enqueue(
        &self,
        envelope: &EventEnvelope,
    ) -> WebhookResult<Vec<WebhookDeliveryAttempt>> {
        let subscriptions = self
            .repo
            .subscriptions_for(&envelope.tenant_id, &envelope.subject)
            .await?;
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let payload = Self::payload(envelope)?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(subscriptions.len());

        for sub in &subscriptions {
            let attempt = WebhookDeliveryAttempt::pending(
                sub,
                envelope.id.as_str(),
                envelope.subject.as_str(),
                payload.clone(),
                now,
            );
            if self.repo.create_attempt(&attempt).await? {
                created.push(attempt);
            }
        }

        tracing::debug!(
            event_id = %envelope.id,
            subscriptions = subscriptions.len(),
            created = created.len(),
            "Webhook attempts enqueued"
        );

        Ok(created)
    }
}

/// Router-facing adapter for [`WebhookFanout`]
pub struct WebhookFanoutHandler {
    fanout: WebhookFanout,
}

impl WebhookFanoutHandler {
    pub fn new(repo: Arc<dyn WebhookRepo>) -> Self {
        Self {
            fanout: WebhookFanout::new(repo),
        }
    }
}

#[async_trait]
impl EventHandler for WebhookFanoutHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<(), HandlerError> {
        match self.fanout.enqueue(ctx.envelope()).await {
            Ok(_) => Ok(()),
            Err(e @ WebhookError::Database(_)) => Err(HandlerError::retriable(e.to_string())),
            Err(e) => Err(HandlerError::permanent(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, WebhookSubscription};
    use crate::repo::InMemoryWebhookRepo;
    use serde_json::json;

    fn event(id: &str, subject: &str) -> EventEnvelope {
        EventEnvelope::new(subject, "t1", json!({"amount": 42}))
            .with_id(id)
            .with_correlation_id("corr-1")
    }

    async fn repo_with(subs: &[WebhookSubscription]) -> Arc<InMemoryWebhookRepo> {
        let repo = Arc::new(InMemoryWebhookRepo::new());
        for sub in subs {
            repo.insert_subscription(sub).await.unwrap();
        }
        repo
    }

    #[test]
    fn test_payload_shape() {
        let envelope = event("evt-1", "invoice.paid");
        let body: serde_json::Value =
            serde_json::from_slice(&WebhookFanout::payload(&envelope).unwrap()).unwrap();

        assert_eq!(body["id"], "evt-1");
        assert_eq!(body["type"], "invoice.paid");
        assert_eq!(body["tenant_id"], "t1");
        assert_eq!(body["correlation_id"], "corr-1");
        assert_eq!(body["data"]["amount"], 42);
        assert!(body["created_at"].is_string());
    }

    #[test]
    fn test_payload_field_order_is_stable() {
        let raw = WebhookFanout::payload(&event("evt-1", "a.b")).unwrap();
        let text = String::from_utf8(raw).unwrap();
        let keys = [
            "\"id\"",
            "\"type\"",
            "\"tenant_id\"",
            "\"created_at\"",
            "\"correlation_id\"",
            "\"data\"",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|k| text.find(k).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_one_attempt_per_matching_subscription() {
        let a = WebhookSubscription::new("t1", "http://a", "s", vec!["invoice.>".into()]);
        let b = WebhookSubscription::new("t1", "http://b", "s", vec!["*".into()]);
        let off = WebhookSubscription::new("t1", "http://c", "s", vec!["*".into()]).disabled();
        let unrelated = WebhookSubscription::new("t1", "http://d", "s", vec!["order.created".into()]);
        let repo = repo_with(&[a.clone(), b.clone(), off, unrelated]).await;

        let fanout = WebhookFanout::new(repo.clone());
        let created = fanout.enqueue(&event("evt-1", "invoice.paid")).await.unwrap();

        assert_eq!(created.len(), 2);
        let mut targets: Vec<_> = created.iter().map(|a| a.webhook_id).collect();
        targets.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(targets, expected);
        assert!(created
            .iter()
            .all(|a| a.status == DeliveryStatus::Pending && a.attempt_no == 0));
        assert_eq!(created[0].payload, created[1].payload);
    }

    #[tokio::test]
    async fn test_redelivered_event_creates_nothing() {
        let sub = WebhookSubscription::new("t1", "http://a", "s", vec!["*".into()]);
        let repo = repo_with(&[sub]).await;
        let fanout = WebhookFanout::new(repo.clone());

        assert_eq!(fanout.enqueue(&event("evt-1", "a.b")).await.unwrap().len(), 1);
        assert!(fanout.enqueue(&event("evt-1", "a.b")).await.unwrap().is_empty());
        assert_eq!(repo.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_other_tenants_subscriptions_ignored() {
        let sub = WebhookSubscription::new("t2", "http://a", "s", vec!["*".into()]);
        let repo = repo_with(&[sub]).await;

        let handler = WebhookFanoutHandler::new(repo.clone());
        handler
            .handle(HandlerContext::new(event("evt-1", "a.b"), None))
            .await
            .unwrap();
        assert!(repo.attempts().is_empty());
    }
}
