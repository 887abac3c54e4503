//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A connection file name did not follow the `kernel-<id>.json` pattern
    #[error("Invalid connection file name: {name}")]
    InvalidConnectionFileName { name: String },

    /// Unknown channel name
    #[error("Invalid channel: {value} (expected broadcast, control or input)")]
    InvalidChannel { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
