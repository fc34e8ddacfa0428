//! Error types for the lab operator

use crate::allocator::IdKind;
use thiserror::Error;

/// Errors produced while resolving and converging a lab.
///
/// "Not found" is never represented here: store lookups return `Option` and
/// absence drives the create-or-skip branching.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// An object with the target name exists but belongs to someone else.
    #[error("{kind} {name} already exists, {detail}")]
    OwnershipConflict {
        kind: String,
        name: String,
        detail: String,
    },

    /// The identifier space has no free value left.
    #[error("no available {0} to allocate")]
    Exhausted(IdKind),

    /// A live object carries an identifier that cannot be parsed.
    #[error("invalid {kind} value {value:?} found on {object}")]
    InvalidIdentifier {
        kind: IdKind,
        value: String,
        object: String,
    },

    /// Bounded wait expired.
    #[error("timed out waiting for {kind} {name} to be removed")]
    Timeout { kind: String, name: String },

    /// Structural or semantic error in a lab or config spec
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An object is missing a field the operator relies on
    #[error("missing field: {0}")]
    MissingField(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a missing-field error with the given message
    pub fn missing(msg: impl Into<String>) -> Self {
        Self::MissingField(msg.into())
    }

    /// Whether the error is an ownership conflict that needs an operator to resolve.
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, Error::OwnershipConflict { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_conflict_message_names_owners() {
        let err = Error::OwnershipConflict {
            kind: "Pod".to_string(),
            name: "lab1-r1".to_string(),
            detail: "and is owned by lab2,lab3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Pod lab1-r1 already exists, and is owned by lab2,lab3"
        );
        assert!(err.is_ownership_conflict());
    }

    #[test]
    fn test_exhausted_names_identifier_kind() {
        let err = Error::Exhausted(IdKind::BridgeIndex);
        assert_eq!(err.to_string(), "no available bridge index to allocate");
    }
}
