//! Error types for Cascade operations.

use crate::engine::Attempt;
use std::fmt;

/// The main error type for Cascade operations.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    /// Provider-specific errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Rate limit errors
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Invalid request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request timeout reported by a backend
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Every backend was tried and none succeeded
    #[error("{0}")]
    Exhausted(ExhaustedBackends),

    /// Cooperative cancellation requested by a stop callback or unit of work.
    ///
    /// Never wrapped and never recorded as an ordinary attempt failure.
    #[error("Stop requested: {0}")]
    StopRequested(String),

    /// Payload did not match the declared schema, even after repair
    #[error("Schema validation failed for '{label}': {}", errors.join("; "))]
    SchemaValidation { label: String, errors: Vec<String> },

    /// Two distinct types sanitize to the same schema label
    #[error("Schema label '{label}' already used by {existing}, cannot register {incoming}")]
    LabelCollision {
        label: String,
        existing: String,
        incoming: String,
    },

    /// Stream errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl AiError {
    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a cancellation signal
    pub fn stop_requested(reason: impl Into<String>) -> Self {
        Self::StopRequested(reason.into())
    }

    /// Create a schema validation error
    pub fn schema_validation(label: impl Into<String>, errors: Vec<String>) -> Self {
        Self::SchemaValidation {
            label: label.into(),
            errors,
        }
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::Network(_) | AiError::Timeout(_) | AiError::RateLimit(_)
        )
    }

    /// Check if this is the cancellation signal.
    ///
    /// Combinators test this before any generic error handling.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AiError::StopRequested(_))
    }

    /// The attempt ledger, if this error is an exhaustion failure
    pub fn attempts(&self) -> Option<&[Attempt]> {
        match self {
            AiError::Exhausted(exhausted) => Some(&exhausted.attempts),
            _ => None,
        }
    }
}

/// Aggregate failure carrying every attempt of an exhausted run, in order.
#[derive(Debug, Clone)]
pub struct ExhaustedBackends {
    pub attempts: Vec<Attempt>,
}

impl fmt::Display for ExhaustedBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exhausted all backends. Failure summary:")?;
        for (index, attempt) in self.attempts.iter().enumerate() {
            let status = if attempt.success { "succeeded" } else { "failed" };
            write!(
                f,
                "\n - Attempt {} with {} {} during '{}' stage",
                index, attempt.backend_id, status, attempt.stage
            )?;
            if let Some(error) = &attempt.error {
                write!(f, ": {}", error)?;
            }
        }
        Ok(())
    }
}
