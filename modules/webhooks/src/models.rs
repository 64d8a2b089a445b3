use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant's registered endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    /// Exact subjects, `prefix.>` wildcards, or `*` for everything
    pub event_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(
        tenant_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
        event_types: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            url: url.into(),
            secret: secret.into(),
            enabled: true,
            event_types,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn wants(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            match pattern.strip_suffix(".>") {
                Some(prefix) => event_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.')),
                None => pattern == event_type,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Dlq,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            "dlq" => Some(DeliveryStatus::Dlq),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Dlq)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on its way to one subscription. The attempt counter belongs to
/// this row alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDeliveryAttempt {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: String,
    /// Exact bytes that are signed and sent
    pub payload: Vec<u8>,
    pub status: DeliveryStatus,
    pub attempt_no: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDeliveryAttempt {
    pub fn pending(
        subscription: &WebhookSubscription,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id: subscription.id,
            event_id: event_id.into(),
            tenant_id: subscription.tenant_id.clone(),
            event_type: event_type.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_no: 0,
            next_run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
            && self.next_run_at <= now
    }
}

/// Terminal record of an attempt that ran out of retries, kept for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDeadLetter {
    pub attempt_id: Uuid,
    pub webhook_id: Uuid,
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub reason: String,
    pub attempt_no: u32,
    pub failed_at: DateTime<Utc>,
}

impl WebhookDeadLetter {
    pub fn from_attempt(
        attempt: &WebhookDeliveryAttempt,
        reason: &str,
        attempt_no: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id: attempt.id,
            webhook_id: attempt.webhook_id,
            event_id: attempt.event_id.clone(),
            tenant_id: attempt.tenant_id.clone(),
            event_type: attempt.event_type.clone(),
            payload: attempt.payload.clone(),
            reason: reason.to_string(),
            attempt_no,
            failed_at,
        }
    }
}
