//! Error taxonomy
//!
//! Every failure surfaced by the crate maps onto one of these variants, each
//! carrying a human-readable reason rather than a native error code.

use thiserror::Error;

/// Errors produced while loading a model, building a context, or serving a request
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    /// File validation or native model loading failed
    #[error("Failed to load model: {0}")]
    FailedToLoad(String),

    /// A configuration value is out of range, or native allocation failed
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The request carries image or video content the pipeline cannot process
    #[error("Vision input is not supported by the loaded model")]
    VisionUnsupported,

    /// Cache bookkeeping and engine state disagree; the session must stop
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl InferenceError {
    /// Returns true if the session cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InferenceError::InvariantViolation(_) | InferenceError::Worker(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_reason() {
        let err = InferenceError::InvalidParameter("top_p must be within [0, 1], got 1.5".into());
        assert_eq!(
            err.to_string(),
            "Invalid parameter: top_p must be within [0, 1], got 1.5"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(InferenceError::InvariantViolation("x".into()).is_fatal());
        assert!(InferenceError::Worker("gone".into()).is_fatal());
        assert!(!InferenceError::VisionUnsupported.is_fatal());
        assert!(!InferenceError::Decode("x".into()).is_fatal());
    }
}
