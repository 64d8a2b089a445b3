use crate::error::{OutboxError, OutboxResult};
use crate::metadata::{self, OutboxState};
use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Failed,
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    /// Statuses the dispatcher picks up once their next attempt is due
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Dispatched | OutboxStatus::DeadLetter)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "dispatched" => Ok(OutboxStatus::Dispatched),
            "failed" => Ok(OutboxStatus::Failed),
            "dead_letter" => Ok(OutboxStatus::DeadLetter),
            other => Err(OutboxError::Codec(format!("unknown status '{}'", other))),
        }
    }
}

/// One event waiting in (or finished with) the outbox
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Same as the envelope id
    pub id: String,
    pub subject: String,
    pub tenant_id: String,
    pub resource_id: Option<String>,
    /// Envelope as published, without bookkeeping metadata
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// New pending record for an envelope that already passed `prepare()`
    pub fn new(envelope: EventEnvelope, resource_id: Option<String>) -> Self {
        let mut envelope = envelope;
        metadata::strip(&mut envelope.metadata);

        Self {
            id: envelope.id.clone(),
            subject: envelope.subject.clone(),
            tenant_id: envelope.tenant_id.clone(),
            resource_id,
            created_at: envelope.created_at,
            envelope,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            dispatched_at: None,
        }
    }

    /// Rebuild a record from a stored envelope carrying bookkeeping metadata
    pub fn from_stored(
        stored: EventEnvelope,
        resource_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> OutboxResult<Self> {
        let state = OutboxState::decode(&stored.metadata)?;
        let mut record = Self::new(stored, resource_id);
        record.created_at = created_at;
        record.apply(state);
        Ok(record)
    }

    /// Envelope with the current state encoded into its metadata, ready to store
    pub fn to_stored(&self) -> EventEnvelope {
        let mut stored = self.envelope.clone();
        self.state().encode_into(&mut stored.metadata);
        stored
    }

    pub fn state(&self) -> OutboxState {
        OutboxState {
            status: self.status,
            retry_count: self.retry_count,
            next_attempt_at: self.next_attempt_at,
            last_error: self.last_error.clone(),
            dispatched_at: self.dispatched_at,
        }
    }

    pub fn apply(&mut self, state: OutboxState) {
        self.status = state.status;
        self.retry_count = state.retry_count;
        self.next_attempt_at = state.next_attempt_at;
        self.last_error = state.last_error;
        self.dispatched_at = state.dispatched_at;
    }

    /// Eligible for a dispatch attempt at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_retry_eligible() && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Bytes handed to the bus
    pub fn publish_bytes(&self) -> OutboxResult<Vec<u8>> {
        Ok(self.envelope.to_bytes()?)
    }
}
