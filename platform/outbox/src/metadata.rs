//! Delivery bookkeeping stored inside the envelope's metadata map.
//!
//! The outbox keeps status, retry count, next attempt and last error next to
//! the payload as `outbox.*` metadata entries. [`OutboxState`] is the only
//! code that reads or writes those keys; everything else works with the typed
//! view.

use crate::error::{OutboxError, OutboxResult};
use crate::record::OutboxStatus;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const STATUS_KEY: &str = "outbox.status";
pub const RETRY_COUNT_KEY: &str = "outbox.retry_count";
pub const NEXT_ATTEMPT_KEY: &str = "outbox.next_attempt_at";
pub const LAST_ERROR_KEY: &str = "outbox.last_error";
pub const DISPATCHED_AT_KEY: &str = "outbox.dispatched_at";

pub const ALL_KEYS: [&str; 5] = [
    STATUS_KEY,
    RETRY_COUNT_KEY,
    NEXT_ATTEMPT_KEY,
    LAST_ERROR_KEY,
    DISPATCHED_AT_KEY,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxState {
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl Default for OutboxState {
    fn default() -> Self {
        Self::pending()
    }
}

impl OutboxState {
    pub fn pending() -> Self {
        Self {
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            dispatched_at: None,
        }
    }

    /// Write this state into `metadata`, replacing any previous bookkeeping.
    /// Absent optional fields remove their key.
    pub fn encode_into(&self, metadata: &mut BTreeMap<String, String>) {
        strip(metadata);
        metadata.insert(STATUS_KEY.to_string(), self.status.as_str().to_string());
        metadata.insert(RETRY_COUNT_KEY.to_string(), self.retry_count.to_string());
        if let Some(at) = self.next_attempt_at {
            metadata.insert(NEXT_ATTEMPT_KEY.to_string(), at.to_rfc3339());
        }
        if let Some(error) = &self.last_error {
            metadata.insert(LAST_ERROR_KEY.to_string(), error.clone());
        }
        if let Some(at) = self.dispatched_at {
            metadata.insert(DISPATCHED_AT_KEY.to_string(), at.to_rfc3339());
        }
    }

    /// Only the bookkeeping keys, as a standalone map (used for partial updates)
    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        self.encode_into(&mut map);
        map
    }

    /// Read the state back. A map without a status key is a freshly created
    /// record and decodes as pending.
    pub fn decode(metadata: &BTreeMap<String, String>) -> OutboxResult<Self> {
        let status = match metadata.get(STATUS_KEY) {
            Some(raw) => raw.parse::<OutboxStatus>()?,
            None => return Ok(Self::pending()),
        };

        let retry_count = match metadata.get(RETRY_COUNT_KEY) {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| OutboxError::Codec(format!("{} = '{}'", RETRY_COUNT_KEY, raw)))?,
            None => 0,
        };

        Ok(Self {
            status,
            retry_count,
            next_attempt_at: decode_time(metadata, NEXT_ATTEMPT_KEY)?,
            last_error: metadata.get(LAST_ERROR_KEY).cloned(),
            dispatched_at: decode_time(metadata, DISPATCHED_AT_KEY)?,
        })
    }
}

fn decode_time(
    metadata: &BTreeMap<String, String>,
    key: &str,
) -> OutboxResult<Option<DateTime<Utc>>> {
    metadata
        .get(key)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| OutboxError::Codec(format!("{} = '{}'", key, raw)))
        })
        .transpose()
}

/// A state transition expressed as metadata edits, so stores can apply it
/// in a single update without reading the row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxPatch {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<&'static str>,
}

impl OutboxPatch {
    fn new(status: OutboxStatus) -> Self {
        let mut set = BTreeMap::new();
        set.insert(STATUS_KEY.to_string(), status.as_str().to_string());
        Self {
            set,
            remove: Vec::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set.insert(key.to_string(), value.into());
        self
    }

    fn without(mut self, key: &'static str) -> Self {
        self.remove.push(key);
        self
    }

    pub fn dispatched(at: DateTime<Utc>) -> Self {
        Self::new(OutboxStatus::Dispatched)
            .with(DISPATCHED_AT_KEY, at.to_rfc3339())
            .without(NEXT_ATTEMPT_KEY)
    }

    pub fn failed(retry_count: u32, next_attempt_at: DateTime<Utc>, error: &str) -> Self {
        Self::new(OutboxStatus::Failed)
            .with(RETRY_COUNT_KEY, retry_count.to_string())
            .with(NEXT_ATTEMPT_KEY, next_attempt_at.to_rfc3339())
            .with(LAST_ERROR_KEY, error)
    }

    pub fn dead_letter(retry_count: u32, error: &str) -> Self {
        Self::new(OutboxStatus::DeadLetter)
            .with(RETRY_COUNT_KEY, retry_count.to_string())
            .with(LAST_ERROR_KEY, error)
            .without(NEXT_ATTEMPT_KEY)
    }

    /// Back to pending with a fresh retry budget. The last error is kept for
    /// the operator.
    pub fn replayed() -> Self {
        Self::new(OutboxStatus::Pending)
            .with(RETRY_COUNT_KEY, "0")
            .without(NEXT_ATTEMPT_KEY)
    }

    pub fn apply(&self, metadata: &mut BTreeMap<String, String>) {
        for key in &self.remove {
            metadata.remove(*key);
        }
        for (key, value) in &self.set {
            metadata.insert(key.clone(), value.clone());
        }
    }
}

/// SQL predicate selecting rows that are due at bind parameter `$now`
/// (pending or failed, next attempt unset or reached). `payload` must be the
/// stored envelope column.
pub fn due_predicate_sql(now_param: &str) -> String {
    format!(
        "payload->'metadata'->>'{status}' IN ('{pending}', '{failed}') \
         AND (payload->'metadata'->>'{next}' IS NULL \
              OR (payload->'metadata'->>'{next}')::timestamptz <= {now})",
        status = STATUS_KEY,
        pending = OutboxStatus::Pending.as_str(),
        failed = OutboxStatus::Failed.as_str(),
        next = NEXT_ATTEMPT_KEY,
        now = now_param,
    )
}

/// SQL expression for the stored status
pub fn status_sql() -> String {
    format!("payload->'metadata'->>'{}'", STATUS_KEY)
}

/// SQL expression for the stored dispatch time
pub fn dispatched_at_sql() -> String {
    format!("(payload->'metadata'->>'{}')::timestamptz", DISPATCHED_AT_KEY)
}

/// Remove every bookkeeping key, leaving caller metadata untouched
pub fn strip(metadata: &mut BTreeMap<String, String>) {
    for key in ALL_KEYS {
        metadata.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encode_decode_failed_state() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let state = OutboxState {
            status: OutboxStatus::Failed,
            retry_count: 3,
            next_attempt_at: Some(at),
            last_error: Some("connection refused".to_string()),
            dispatched_at: None,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "billing".to_string());
        state.encode_into(&mut metadata);

        assert_eq!(metadata.get(STATUS_KEY).map(String::as_str), Some("failed"));
        assert_eq!(OutboxState::decode(&metadata).unwrap(), state);
        assert_eq!(metadata.get("source").map(String::as_str), Some("billing"));
    }

    #[test]
    fn test_encode_clears_stale_keys() {
        let mut metadata = OutboxState {
            status: OutboxStatus::Failed,
            retry_count: 1,
            next_attempt_at: Some(Utc::now()),
            last_error: Some("boom".to_string()),
            dispatched_at: None,
        }
        .encode();

        OutboxState::pending().encode_into(&mut metadata);

        assert!(!metadata.contains_key(NEXT_ATTEMPT_KEY));
        assert!(!metadata.contains_key(LAST_ERROR_KEY));
        assert_eq!(OutboxState::decode(&metadata).unwrap(), OutboxState::pending());
    }

    #[test]
    fn test_missing_status_decodes_as_pending() {
        let metadata = BTreeMap::new();
        assert_eq!(OutboxState::decode(&metadata).unwrap(), OutboxState::pending());
    }

    #[test]
    fn test_corrupt_values_are_rejected() {
        let mut metadata = BTreeMap::new();
        metadata.insert(STATUS_KEY.to_string(), "exploded".to_string());
        assert!(matches!(OutboxState::decode(&metadata), Err(OutboxError::Codec(_))));

        let mut metadata = BTreeMap::new();
        metadata.insert(STATUS_KEY.to_string(), "failed".to_string());
        metadata.insert(RETRY_COUNT_KEY.to_string(), "-1".to_string());
        assert!(matches!(OutboxState::decode(&metadata), Err(OutboxError::Codec(_))));
    }

    #[test]
    fn test_patches_walk_the_lifecycle() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut metadata = OutboxState::pending().encode();

        OutboxPatch::failed(1, now, "timeout").apply(&mut metadata);
        let state = OutboxState::decode(&metadata).unwrap();
        assert_eq!(state.status, OutboxStatus::Failed);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.next_attempt_at, Some(now));

        OutboxPatch::dead_letter(10, "still timing out").apply(&mut metadata);
        let state = OutboxState::decode(&metadata).unwrap();
        assert_eq!(state.status, OutboxStatus::DeadLetter);
        assert_eq!(state.next_attempt_at, None);
        assert_eq!(state.last_error.as_deref(), Some("still timing out"));

        OutboxPatch::replayed().apply(&mut metadata);
        let state = OutboxState::decode(&metadata).unwrap();
        assert_eq!(state.status, OutboxStatus::Pending);
        assert_eq!(state.retry_count, 0);

        OutboxPatch::dispatched(now).apply(&mut metadata);
        let state = OutboxState::decode(&metadata).unwrap();
        assert_eq!(state.status, OutboxStatus::Dispatched);
        assert_eq!(state.dispatched_at, Some(now));
    }

    #[test]
    fn test_due_predicate_mentions_codec_keys() {
        let sql = due_predicate_sql("$1");
        assert!(sql.contains("'outbox.status'"));
        assert!(sql.contains("'outbox.next_attempt_at'"));
        assert!(sql.contains("<= $1"));
    }

    #[test]
    fn test_strip_keeps_caller_metadata() {
        let mut metadata = OutboxState::pending().encode();
        metadata.insert("trace".to_string(), "abc".to_string());
        strip(&mut metadata);
        assert_eq!(metadata.len(), 1);
    }
}
