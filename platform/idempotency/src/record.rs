use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(IdempotencyStatus::Processing),
            "completed" => Some(IdempotencyStatus::Completed),
            _ => None,
        }
    }
}

/// Durable record of one client request, keyed by `(tenant_id, key)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: String,
    pub key: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing(
        tenant_id: &str,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Processing,
            response: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }
}

/// Hex SHA-256 of the raw request body
pub fn request_hash(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}
