#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// Same key, different request body. Never retryable.
    #[error("idempotency key '{key}' was already used with a different request for tenant {tenant_id}")]
    KeyReuse { tenant_id: String, key: String },

    #[error("idempotency record '{key}' is already completed")]
    AlreadyCompleted { key: String },

    #[error("idempotency record '{key}' not found")]
    NotFound { key: String },

    #[error("invalid idempotency request: {0}")]
    Invalid(String),

    #[error("idempotency store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IdempotencyError {
    /// Only store failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, IdempotencyError::Store(_) | IdempotencyError::Database(_))
    }
}

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;
