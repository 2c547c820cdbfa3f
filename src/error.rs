//! Error types for the MME descriptor generator
//!
//! Only parameter validation and the outer surfaces (JSON, file access)
//! produce recoverable errors. Broken internal invariants panic.

use thiserror::Error;

/// Result type for descriptor generation
pub type DescGenResult<T> = Result<T, DescGenError>;

/// Descriptor generation errors
#[derive(Debug, Error)]
pub enum DescGenError {
    #[error("Invalid layer params: {message}")]
    InvalidParams { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DescGenError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        DescGenError::InvalidParams { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DescGenError::Config { message: msg.into() }
    }

    /// The validation message, if this error came from params validation
    pub fn validation_message(&self) -> Option<&str> {
        match self {
            DescGenError::InvalidParams { message } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_params_message() {
        let err = DescGenError::invalid_params("input element types should match");
        assert_eq!(err.to_string(), "Invalid layer params: input element types should match");
        assert_eq!(err.validation_message(), Some("input element types should match"));
    }

    #[test]
    fn test_config_error_has_no_validation_message() {
        let err = DescGenError::config("unknown chip");
        assert!(err.validation_message().is_none());
    }
}
