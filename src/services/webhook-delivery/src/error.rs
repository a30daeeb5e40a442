//! Error handling module for the AI-CORE Webhook Delivery Service
//!
//! Every failure that can surface from the registry, dispatcher, delivery worker,
//! stores and queue is expressed as a [`WebhookDeliveryError`]. Delivery-path
//! failures are recorded on the delivery record rather than returned to the code
//! that emitted the lifecycle event.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for webhook delivery operations
pub type WebhookDeliveryResult<T> = Result<T, WebhookDeliveryError>;

/// Comprehensive error types for the webhook delivery service
#[derive(Error, Debug)]
pub enum WebhookDeliveryError {
    /// Invalid endpoint definition or service configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A custom condition predicate failed
    #[error("Condition evaluation error in predicate '{predicate}': {message}")]
    ConditionEvaluation { predicate: String, message: String },

    /// Network failure or timeout while talking to an endpoint
    #[error("Delivery transport error: {message}")]
    DeliveryTransport { message: String, timed_out: bool },

    /// Endpoint answered with a non-2xx status
    #[error("Delivery rejected with HTTP {status_code}")]
    DeliveryRejected { status_code: u16, retryable: bool },

    /// A delivery reached its attempt limit
    #[error("Delivery {delivery_id} exhausted {attempts} attempts")]
    ExhaustedRetries { delivery_id: Uuid, attempts: u32 },

    /// Requested resource does not exist
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// A state transition that the record's current state does not allow
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Database operation errors
    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    /// Redis operation errors
    #[error("Redis error: {source}")]
    Redis {
        #[from]
        source: redis::RedisError,
    },

    /// Redis pool errors
    #[error("Redis pool error: {message}")]
    RedisPool { message: String },

    /// HTTP client construction errors
    #[error("HTTP client error: {source}")]
    HttpClient {
        #[from]
        source: reqwest::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Delivery queue errors
    #[error("Queue error: {message}")]
    Queue { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WebhookDeliveryError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new condition evaluation error
    pub fn condition_evaluation<S1: Into<String>, S2: Into<String>>(
        predicate: S1,
        message: S2,
    ) -> Self {
        Self::ConditionEvaluation {
            predicate: predicate.into(),
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S, timed_out: bool) -> Self {
        Self::DeliveryTransport {
            message: message.into(),
            timed_out,
        }
    }

    /// Create a new rejected-delivery error
    pub fn rejected(status_code: u16, retryable: bool) -> Self {
        Self::DeliveryRejected {
            status_code,
            retryable,
        }
    }

    /// Create a new exhausted-retries error
    pub fn exhausted(delivery_id: Uuid, attempts: u32) -> Self {
        Self::ExhaustedRetries {
            delivery_id,
            attempts,
        }
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a new queue error
    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the error code for this error (for logs and admin responses)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::ConditionEvaluation { .. } => "CONDITION_EVALUATION_ERROR",
            Self::DeliveryTransport { .. } => "DELIVERY_TRANSPORT_ERROR",
            Self::DeliveryRejected { .. } => "DELIVERY_REJECTED",
            Self::ExhaustedRetries { .. } => "EXHAUSTED_RETRIES",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Redis { .. } | Self::RedisPool { .. } => "CACHE_ERROR",
            Self::HttpClient { .. } => "HTTP_CLIENT_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Queue { .. } => "QUEUE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeliveryTransport { .. }
            | Self::Database { .. }
            | Self::Redis { .. }
            | Self::RedisPool { .. }
            | Self::Queue { .. } => true,
            Self::DeliveryRejected { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<deadpool_redis::PoolError> for WebhookDeliveryError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::RedisPool {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error() {
        let error = WebhookDeliveryError::configuration("url must use http or https");
        assert_eq!(
            error.to_string(),
            "Configuration error: url must use http or https"
        );
        assert_eq!(error.error_code(), "CONFIGURATION_ERROR");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_rejected_error_retryability_follows_policy() {
        let retryable = WebhookDeliveryError::rejected(503, true);
        assert!(retryable.is_retryable());
        assert_eq!(retryable.to_string(), "Delivery rejected with HTTP 503");

        let terminal = WebhookDeliveryError::rejected(404, false);
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn test_transport_error_is_retryable() {
        let error = WebhookDeliveryError::transport("connection refused", false);
        assert!(error.is_retryable());
        assert_eq!(error.error_code(), "DELIVERY_TRANSPORT_ERROR");
    }

    #[test]
    fn test_exhausted_retries_error() {
        let id = Uuid::new_v4();
        let error = WebhookDeliveryError::exhausted(id, 3);
        assert!(error.to_string().contains(&id.to_string()));
        assert!(!error.is_retryable());
    }
}
