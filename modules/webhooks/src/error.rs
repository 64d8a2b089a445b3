#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("delivery attempt {0} not found")]
    AttemptNotFound(String),

    #[error("delivery attempt {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: String,
        expected: String,
    },

    #[error("invalid webhook subscription: {0}")]
    Invalid(String),

    #[error("failed to sign payload: {0}")]
    Signing(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type WebhookResult<T> = Result<T, WebhookError>;
