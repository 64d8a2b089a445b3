use event_bus::BusError;

/// Outcome of a failed handler or pre-handler call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt (lock timeout, unavailable dependency)
    #[error("retriable: {0}")]
    Retriable(String),

    /// Retrying cannot help (validation, unknown entity)
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retriable(msg: impl Into<String>) -> Self {
        HandlerError::Retriable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, HandlerError::Retriable(_))
    }
}

impl From<outbox::OutboxError> for HandlerError {
    fn from(e: outbox::OutboxError) -> Self {
        match e {
            outbox::OutboxError::Database(_) => HandlerError::Retriable(e.to_string()),
            other => HandlerError::Permanent(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("a handler is already registered for '{0}'")]
    DuplicateRoute(String),

    #[error("invalid subject pattern '{0}'")]
    InvalidSubject(String),

    #[error("router has no registered handlers")]
    NoRoutes,

    #[error("failed to subscribe to '{subject}': {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BusError,
    },
}
