use event_bus::EnvelopeError;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("envelope rejected: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("outbox record {0} already exists")]
    Duplicate(String),

    #[error("outbox record {0} not found")]
    NotFound(String),

    #[error("outbox record {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: String,
        expected: String,
    },

    #[error("corrupt outbox metadata: {0}")]
    Codec(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type OutboxResult<T> = Result<T, OutboxError>;
