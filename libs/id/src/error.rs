//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing a typed ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is missing the underscore separator between prefix and payload.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ID has a prefix belonging to a different resource type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID payload is malformed.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
