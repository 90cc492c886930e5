//! Error taxonomy shared by every channel.
//!
//! Errors raised anywhere in the invocation pipeline are expressed as
//! [`ProxyError`] variants. The HTTP layer maps variants to status codes
//! (422 validation, 404 not-found, 401 invalid-token, 403 forbidden,
//! 500 otherwise); the CLI prints the message and exits non-zero.

use serde::Serialize;

/// Result alias used across gproxy crates.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// A single field-level validation failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    /// Parameter name that failed validation.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Unified error type for the invocation pipeline.
///
/// Sensitive values (tokens, encryption keys) must never appear in any
/// variant payload.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Request parameters do not match the method descriptor.
    #[error("validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    /// Record or method not found.
    #[error("{0}")]
    NotFound(String),

    /// A single-record predicate matched more than one row.
    #[error("{0}")]
    DuplicateRecord(String),

    /// Presented token is neither the admin token nor a live tenant token.
    #[error("invalid API token")]
    InvalidToken,

    /// Admin-only surface reached with a tenant token.
    #[error("{0}")]
    Forbidden(String),

    /// Bad connection string, missing instance, misuse of the SQL layer.
    #[error("{0}")]
    Configuration(String),

    /// Driver-level connection failure (timeout, refused).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Error surfaced by a database driver during a query.
    #[error("database error: {0}")]
    Database(String),

    /// Field encryption failure on write.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// Shorthand for a single-field validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ProxyError::NotFound(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ProxyError::Configuration(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal(message.into())
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = ProxyError::Validation(vec![
            FieldError::new("tenant_id", "field required"),
            FieldError::new("port", "expected integer"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("tenant_id: field required"));
        assert!(msg.contains("port: expected integer"));
    }

    #[test]
    fn test_single_field_shorthand() {
        let err = ProxyError::validation("id", "field required");
        match err {
            ProxyError::Validation(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "id");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_token_does_not_leak_token() {
        assert_eq!(ProxyError::InvalidToken.to_string(), "invalid API token");
    }
}
