use crate::error::{WebhookError, WebhookResult};
use crate::models::{DeliveryStatus, WebhookDeadLetter, WebhookDeliveryAttempt, WebhookSubscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> WebhookResult<()>;

    async fn get_subscription(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>>;

    /// Enabled subscriptions of `tenant_id` that want `event_type`
    async fn subscriptions_for(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> WebhookResult<Vec<WebhookSubscription>>;

    /// Returns false if the `(webhook_id, event_id)` pair already has an attempt
    async fn create_attempt(&self, attempt: &WebhookDeliveryAttempt) -> WebhookResult<bool>;

    async fn get_attempt(&self, id: Uuid) -> WebhookResult<Option<WebhookDeliveryAttempt>>;

    /// `pending`/`failed` attempts with `next_run_at <= now`, soonest first
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> WebhookResult<Vec<WebhookDeliveryAttempt>>;

    async fn mark_success(&self, id: Uuid, now: DateTime<Utc>) -> WebhookResult<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_no: u32,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<()>;

    /// Set the attempt to `dlq` and write its dead-letter row, atomically
    async fn move_to_dlq(
        &self,
        attempt: &WebhookDeliveryAttempt,
        attempt_no: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<()>;

    async fn list_dead_letters(&self, tenant_id: &str) -> WebhookResult<Vec<WebhookDeadLetter>>;

    /// `dlq -> pending` with a fresh counter; the dead-letter row is removed
    async fn replay_dead_letter(&self, attempt_id: Uuid, now: DateTime<Utc>) -> WebhookResult<()>;
}

#[derive(Debug, Default)]
struct State {
    subscriptions: HashMap<Uuid, WebhookSubscription>,
    attempts: Vec<WebhookDeliveryAttempt>,
    dead_letters: Vec<WebhookDeadLetter>,
}

/// Mutex-guarded repo for tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryWebhookRepo {
    state: Mutex<State>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn attempts(&self) -> Vec<WebhookDeliveryAttempt> {
        self.lock().attempts.clone()
    }

    /// Change a subscription in place (toggle, rotate secret, move URL)
    pub fn update_subscription(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut WebhookSubscription),
    ) -> WebhookResult<()> {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| WebhookError::SubscriptionNotFound(id.to_string()))?;
        f(sub);
        sub.updated_at = Utc::now();
        Ok(())
    }
}

fn retryable_attempt(state: &mut State, id: Uuid) -> WebhookResult<&mut WebhookDeliveryAttempt> {
    let attempt = state
        .attempts
        .iter_mut()
        .find(|a| a.id == id)
        .ok_or_else(|| WebhookError::AttemptNotFound(id.to_string()))?;

    if attempt.status.is_terminal() {
        return Err(WebhookError::InvalidState {
            id: id.to_string(),
            status: attempt.status.to_string(),
            expected: "pending or failed".to_string(),
        });
    }
    Ok(attempt)
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> WebhookResult<()> {
        if subscription.url.trim().is_empty() {
            return Err(WebhookError::Invalid("url cannot be empty".to_string()));
        }
        self.lock()
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn subscriptions_for(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> WebhookResult<Vec<WebhookSubscription>> {
        let mut subs: Vec<_> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.enabled && s.tenant_id == tenant_id && s.wants(event_type))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn create_attempt(&self, attempt: &WebhookDeliveryAttempt) -> WebhookResult<bool> {
        let mut state = self.lock();
        if state
            .attempts
            .iter()
            .any(|a| a.webhook_id == attempt.webhook_id && a.event_id == attempt.event_id)
        {
            return Ok(false);
        }
        state.attempts.push(attempt.clone());
        Ok(true)
    }

    async fn get_attempt(&self, id: Uuid) -> WebhookResult<Option<WebhookDeliveryAttempt>> {
        Ok(self.lock().attempts.iter().find(|a| a.id == id).cloned())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> WebhookResult<Vec<WebhookDeliveryAttempt>> {
        let mut due: Vec<_> = self
            .lock()
            .attempts
            .iter()
            .filter(|a| a.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|a| (a.next_run_at, a.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_success(&self, id: Uuid, now: DateTime<Utc>) -> WebhookResult<()> {
        let mut state = self.lock();
        let attempt = retryable_attempt(&mut state, id)?;
        attempt.status = DeliveryStatus::Success;
        attempt.last_error = None;
        attempt.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_no: u32,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let mut state = self.lock();
        let attempt = retryable_attempt(&mut state, id)?;
        attempt.status = DeliveryStatus::Failed;
        attempt.attempt_no = attempt_no;
        attempt.next_run_at = next_run_at;
        attempt.last_error = Some(error.to_string());
        attempt.updated_at = now;
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        attempt: &WebhookDeliveryAttempt,
        attempt_no: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let mut state = self.lock();
        let stored = retryable_attempt(&mut state, attempt.id)?;
        stored.status = DeliveryStatus::Dlq;
        stored.attempt_no = attempt_no;
        stored.last_error = Some(reason.to_string());
        stored.updated_at = now;

        let dead = WebhookDeadLetter::from_attempt(stored, reason, attempt_no, now);
        state.dead_letters.push(dead);
        Ok(())
    }

    async fn list_dead_letters(&self, tenant_id: &str) -> WebhookResult<Vec<WebhookDeadLetter>> {
        Ok(self
            .lock()
            .dead_letters
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn replay_dead_letter(&self, attempt_id: Uuid, now: DateTime<Utc>) -> WebhookResult<()> {
        let mut state = self.lock();
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or_else(|| WebhookError::AttemptNotFound(attempt_id.to_string()))?;

        if attempt.status != DeliveryStatus::Dlq {
            return Err(WebhookError::InvalidState {
                id: attempt_id.to_string(),
                status: attempt.status.to_string(),
                expected: DeliveryStatus::Dlq.to_string(),
            });
        }

        attempt.status = DeliveryStatus::Pending;
        attempt.attempt_no = 0;
        attempt.next_run_at = now;
        attempt.last_error = None;
        attempt.updated_at = now;

        state.dead_letters.retain(|d| d.attempt_id != attempt_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (InMemoryWebhookRepo, WebhookSubscription, WebhookDeliveryAttempt) {
        let repo = InMemoryWebhookRepo::new();
        let sub = WebhookSubscription::new("t1", "http://localhost/hook", "s", vec!["*".into()]);
        repo.insert_subscription(&sub).await.unwrap();
        let attempt = WebhookDeliveryAttempt::pending(&sub, "evt-1", "a.b", b"{}".to_vec(), Utc::now());
        assert!(repo.create_attempt(&attempt).await.unwrap());
        (repo, sub, attempt)
    }

    #[tokio::test]
    async fn test_one_attempt_per_subscription_and_event() {
        let (repo, sub, _) = seeded().await;
        let again = WebhookDeliveryAttempt::pending(&sub, "evt-1", "a.b", b"{}".to_vec(), Utc::now());
        assert!(!repo.create_attempt(&again).await.unwrap());
        assert_eq!(repo.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_attempts_are_not_rewritten() {
        let (repo, _, attempt) = seeded().await;
        let now = Utc::now();
        repo.mark_success(attempt.id, now).await.unwrap();

        assert!(matches!(
            repo.mark_failed(attempt.id, 1, now, "late", now).await,
            Err(WebhookError::InvalidState { .. })
        ));
        assert!(repo.list_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dlq_and_replay() {
        let (repo, _, attempt) = seeded().await;
        let now = Utc::now();

        repo.move_to_dlq(&attempt, 5, "HTTP 500", now).await.unwrap();
        let dead = repo.list_dead_letters("t1").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "HTTP 500");
        assert_eq!(dead[0].payload, b"{}".to_vec());
        assert!(repo.list_due(now, 10).await.unwrap().is_empty());

        repo.replay_dead_letter(attempt.id, now).await.unwrap();
        let replayed = repo.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, DeliveryStatus::Pending);
        assert_eq!(replayed.attempt_no, 0);
        assert!(repo.list_dead_letters("t1").await.unwrap().is_empty());

        assert!(matches!(
            repo.replay_dead_letter(attempt.id, now).await,
            Err(WebhookError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscriptions_for_filters_disabled_and_tenant() {
        let repo = InMemoryWebhookRepo::new();
        let on = WebhookSubscription::new("t1", "http://a", "s", vec!["invoice.>".into()]);
        let off = WebhookSubscription::new("t1", "http://b", "s", vec!["*".into()]).disabled();
        let other = WebhookSubscription::new("t2", "http://c", "s", vec!["*".into()]);
        for sub in [&on, &off, &other] {
            repo.insert_subscription(sub).await.unwrap();
        }

        let found = repo.subscriptions_for("t1", "invoice.paid").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, on.id);
    }
}
