//! Kernel session identity and lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DomainError, DomainResult};

/// Prefix of kernel connection file names in the Jupyter runtime directory.
pub const CONNECTION_FILE_PREFIX: &str = "kernel-";

/// Extension of kernel connection files.
pub const CONNECTION_FILE_EXTENSION: &str = "json";

/// Unique identifier for a running kernel.
///
/// Wraps the kernel id string (e.g., "8e11bfb5-7dc2-432b-9206-928fa5c35731")
/// taken from the connection file name `kernel-<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    ///
    /// The id is opaque; no format validation is performed.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a session id from a connection file name.
    ///
    /// `kernel-abc123.json` becomes `abc123`. Names that do not carry the
    /// `kernel-` prefix and `.json` extension are rejected.
    pub fn from_connection_file_name(name: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidConnectionFileName {
            name: name.to_string(),
        };

        let stem = name
            .strip_suffix(CONNECTION_FILE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let id = stem.strip_prefix(CONNECTION_FILE_PREFIX).ok_or_else(invalid)?;

        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self(id.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a monitored kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection file seen, channels not yet open.
    #[default]
    Discovered,
    /// All three channels open and being polled.
    Monitoring,
    /// Monitor has finished (stopped, failed to connect, or channels closed).
    Stopped,
}

impl SessionState {
    /// Returns a lowercase label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Monitoring => "monitoring",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_connection_file_name() {
        let id = SessionId::from_connection_file_name("kernel-8e11bfb5-7dc2.json").unwrap();
        assert_eq!(id.as_str(), "8e11bfb5-7dc2");
    }

    #[test]
    fn test_session_id_rejects_foreign_files() {
        for name in ["nbserver-123.json", "kernel-abc.txt", "kernel-.json", "kernel-abc"] {
            let result = SessionId::from_connection_file_name(name);
            assert!(
                matches!(result, Err(DomainError::InvalidConnectionFileName { .. })),
                "expected rejection for {name}, got {result:?}"
            );
        }
    }

    #[test]
    fn test_session_id_short() {
        let id = SessionId::new("8e11bfb5-7dc2-432b-9206-928fa5c35731");
        assert_eq!(id.short(), "8e11bfb5");

        let id = SessionId::new("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_session_id_serializes_transparently() {
        let id = SessionId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_session_state_default_and_labels() {
        assert_eq!(SessionState::default(), SessionState::Discovered);
        assert_eq!(SessionState::Monitoring.to_string(), "monitoring");
        assert_eq!(SessionState::Stopped.label(), "stopped");
    }
}
