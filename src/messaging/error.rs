//! Error types for messaging operations

use crate::error::AppError;
use crate::messaging::validation::ValidationFailure;

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    /// Connection failed or was lost
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish rejected by the broker
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Mandatory message could not be routed to any queue
    #[error("Message unroutable: no queue bound to exchange '{exchange}' for routing key '{routing_key}'")]
    Unroutable { exchange: String, routing_key: String },

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The producer or transport has been closed
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation not supported by the underlying transport
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Inbound payload failed shape or constraint validation
    #[error("{0}")]
    Validation(ValidationFailure),

    /// A consumer handler failed
    #[error("Handler failed: {message}")]
    Handler { message: String, transient: bool },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MessagingError {
    /// Build a handler error that is worth retrying
    pub fn transient(message: impl Into<String>) -> Self {
        MessagingError::Handler {
            message: message.into(),
            transient: true,
        }
    }

    /// Build a handler error that will never succeed on retry
    pub fn permanent(message: impl Into<String>) -> Self {
        MessagingError::Handler {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MessagingError::ConnectionFailed(_)
            | MessagingError::PublishFailed(_)
            | MessagingError::Timeout(_) => true,
            MessagingError::Handler { transient, .. } => *transient,
            MessagingError::Unroutable { .. }
            | MessagingError::SubscribeFailed(_)
            | MessagingError::Closed(_)
            | MessagingError::Unsupported(_)
            | MessagingError::Validation(_)
            | MessagingError::Serialization(_)
            | MessagingError::Configuration(_) => false,
        }
    }

    /// Short machine-readable classification used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::ConnectionFailed(_) => "connection",
            MessagingError::PublishFailed(_) => "publish",
            MessagingError::Unroutable { .. } => "unroutable",
            MessagingError::SubscribeFailed(_) => "subscribe",
            MessagingError::Closed(_) => "closed",
            MessagingError::Timeout(_) => "timeout",
            MessagingError::Unsupported(_) => "unsupported",
            MessagingError::Validation(_) => "validation",
            MessagingError::Handler { .. } => "handler",
            MessagingError::Serialization(_) => "serialization",
            MessagingError::Configuration(_) => "configuration",
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Serialization(err.to_string())
    }
}

impl From<ValidationFailure> for MessagingError {
    fn from(failure: ValidationFailure) -> Self {
        MessagingError::Validation(failure)
    }
}

impl From<MessagingError> for AppError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::Configuration(msg) => AppError::Configuration(msg),
            MessagingError::Validation(failure) => AppError::Validation(failure.to_string()),
            MessagingError::Timeout(msg) => AppError::Timeout(msg),
            MessagingError::ConnectionFailed(msg) | MessagingError::Closed(msg) => {
                AppError::Broker(msg)
            }
            MessagingError::Serialization(msg) => AppError::Serialization(msg),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MessagingError::ConnectionFailed("down".into()).is_transient());
        assert!(MessagingError::Timeout("slow".into()).is_transient());
        assert!(MessagingError::transient("busy").is_transient());
        assert!(!MessagingError::permanent("bad data").is_transient());
        assert!(!MessagingError::Closed("producer".into()).is_transient());
    }

    #[test]
    fn test_app_error_conversion() {
        let app_err: AppError = MessagingError::Configuration("bad".into()).into();
        assert!(matches!(app_err, AppError::Configuration(_)));

        let app_err: AppError = MessagingError::Timeout("confirm".into()).into();
        assert!(matches!(app_err, AppError::Timeout(_)));
    }

    #[test]
    fn test_unroutable_display() {
        let err = MessagingError::Unroutable {
            exchange: "audit".into(),
            routing_key: "nowhere".into(),
        };
        assert_eq!(
            err.to_string(),
            "Message unroutable: no queue bound to exchange 'audit' for routing key 'nowhere'"
        );
        assert_eq!(err.kind(), "unroutable");
    }
}
