//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur while building or validating domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },

    /// A lifecycle transition that the current phase does not allow
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl DomainError {
    /// Shorthand for an invalid field value.
    pub fn invalid(field: &str, value: impl ToString, expected: &str) -> Self {
        Self::InvalidFieldValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
