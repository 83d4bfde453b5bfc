//! Error taxonomy for the anomaly pipeline.
//!
//! Validation errors are local and recoverable (the record is dropped and
//! counted). Dependency errors split into transient (retried with backoff)
//! and permanent (routed to dead-letter). Consistency violations quarantine
//! the affected entity and are never silently corrected.

use std::fmt;
use thiserror::Error;

/// Why a raw record was rejected by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The payload is not a JSON object
    InvalidPayload,
    /// A required field is absent or blank
    MissingField,
    /// A field is present but cannot be coerced to its type
    MalformedField,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationErrorKind::InvalidPayload => "invalid_payload",
            ValidationErrorKind::MissingField => "missing_field",
            ValidationErrorKind::MalformedField => "malformed_field",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} ({field}): {detail}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub field: &'static str,
    pub detail: String,
}

impl ValidationError {
    pub fn missing(field: &'static str) -> Self {
        Self {
            kind: ValidationErrorKind::MissingField,
            field,
            detail: "field is required".to_string(),
        }
    }

    pub fn malformed(field: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::MalformedField,
            field,
            detail: detail.into(),
        }
    }

    pub fn invalid_payload(detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::InvalidPayload,
            field: "payload",
            detail: detail.into(),
        }
    }
}

/// Failure talking to an external collaborator (scorer, store, sink)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// Timeout or temporary unavailability; safe to retry
    #[error("transient dependency error: {0}")]
    Transient(String),

    /// Bad request, auth failure, undecodable response; never retried
    #[error("permanent dependency error: {0}")]
    Permanent(String),
}

impl DependencyError {
    pub fn transient(msg: impl Into<String>) -> Self {
        DependencyError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        DependencyError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DependencyError::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateStoreError {
    /// Persistence failed after the retry budget was spent (or permanently)
    #[error("persistence failed for entity {entity_id} after {attempts} attempt(s): {source}")]
    Persistence {
        entity_id: String,
        attempts: u32,
        #[source]
        source: DependencyError,
    },

    /// Applying the update would double-count or lose a prior update
    #[error("consistency violation for entity {entity_id}: {detail}")]
    ConsistencyViolation { entity_id: String, detail: String },
}

pub type StoreResult<T> = Result<T, StateStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::malformed("amount", "not a number: \"abc\"");
        assert_eq!(
            err.to_string(),
            "malformed_field (amount): not a number: \"abc\""
        );
        assert_eq!(err.kind, ValidationErrorKind::MalformedField);
    }

    #[test]
    fn test_dependency_error_classification() {
        assert!(DependencyError::transient("timeout").is_transient());
        assert!(!DependencyError::permanent("400 bad request").is_transient());
    }
}
