use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Lock timeouts, busy databases, deadlocks, dropped connections.
    /// The retry policy retries these; everything else propagates.
    #[error("Transient backend error during {operation}: {reason}")]
    Transient { operation: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Failed to send message (correlation id {correlation_id}): {reason}")]
    Send {
        correlation_id: String,
        reason: String,
    },

    #[error("Failed to receive message: {reason}")]
    Receive { reason: String },

    #[error("Failed to commit message {message_id} (correlation id {correlation_id}): {reason}")]
    Commit {
        message_id: String,
        correlation_id: String,
        reason: String,
    },

    #[error("Failed to roll back message {message_id} (correlation id {correlation_id}): {reason}")]
    Rollback {
        message_id: String,
        correlation_id: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Codec not found: {0}")]
    CodecNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("RPC response not received in time (correlation id {correlation_id})")]
    RpcTimeout { correlation_id: String },

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the retry policy may re-run the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure raised by a message handler - decides between retry and poison
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Counted against the retry limit, then rolled back for redelivery
    #[error("{exception_type}: {message}")]
    Retryable {
        exception_type: String,
        message: String,
    },

    /// Moved to the error table on first occurrence
    #[error("{exception_type} (permanent): {message}")]
    Permanent {
        exception_type: String,
        message: String,
    },
}

impl HandlerError {
    pub fn retryable(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    pub fn permanent(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Name used as the error-tracking key
    pub fn exception_type(&self) -> &str {
        match self {
            Self::Retryable { exception_type, .. } | Self::Permanent { exception_type, .. } => {
                exception_type
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Permanent { message, .. } => message,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                Self::transient("sqlite", err.to_string())
            }
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                let busy = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false);
                if busy || db.message().contains("database is locked") {
                    Self::transient("sqlite", db.message().to_string())
                } else {
                    Self::Backend(db.message().to_string())
                }
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable_by_policy() {
        assert!(QueueError::transient("receive", "database is locked").is_transient());
        assert!(!QueueError::Backend("syntax error".into()).is_transient());
        assert!(!QueueError::WorkerShutdown.is_transient());
    }

    #[test]
    fn handler_error_accessors() {
        let err = HandlerError::permanent("FormatError", "bad body");
        assert!(!err.is_retryable());
        assert_eq!(err.exception_type(), "FormatError");
        assert_eq!(err.message(), "bad body");
        assert_eq!(err.to_string(), "FormatError (permanent): bad body");
    }
}
