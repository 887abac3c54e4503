//! Registry actor commands, errors, and views.
//!
//! - `RegistryCommand`: commands sent to the actor
//! - `RegistryError`: why a registry operation failed
//! - `Rejected`: a failed registration, carrying the monitor back to the caller
//! - `SessionView`: read-only snapshot of one registered monitor

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use nblog_core::{SessionId, SessionState};

use crate::session::MonitorHandle;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command carries a oneshot channel for the response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a running monitor.
    ///
    /// The monitor is boxed to keep the enum small.
    ///
    /// # Errors
    /// - `RegistryError::SessionAlreadyMonitored` if the id is taken
    /// - `RegistryError::Full` if at maximum capacity
    Register {
        monitor: Box<MonitorHandle>,
        respond_to: oneshot::Sender<Result<(), Rejected>>,
    },

    /// Remove a monitor, handing it back so the caller can stop it.
    ///
    /// Responds with `None` if nothing was registered under the id.
    Deregister {
        session_id: SessionId,
        reason: RemovalReason,
        respond_to: oneshot::Sender<Option<Box<MonitorHandle>>>,
    },

    /// Remove every monitor whose task has already ended.
    PruneFinished {
        respond_to: oneshot::Sender<Vec<MonitorHandle>>,
    },

    /// Ids of all registered monitors, sorted.
    SessionIds {
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },

    /// Get a single session view by id.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionView>>,
    },

    /// Get all session views, sorted by id.
    GetAllSessions {
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    /// Remove every monitor. Used at shutdown.
    Drain {
        respond_to: oneshot::Sender<Vec<MonitorHandle>>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    Full { max: usize },

    /// A monitor is already registered for this session.
    #[error("session already monitored: {0}")]
    SessionAlreadyMonitored(SessionId),

    /// The actor has shut down.
    #[error("registry channel closed")]
    ChannelClosed,
}

/// A rejected registration.
///
/// `monitor` is the handle that was offered, returned so the caller can
/// stop it. It is `None` only if the actor went away while holding it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Rejected {
    pub error: RegistryError,
    pub monitor: Option<Box<MonitorHandle>>,
}

/// Reason why a monitor was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The kernel's connection file disappeared.
    Vanished,

    /// The monitor ended on its own (connect failure, channel closed).
    Finished,

    /// The daemon is shutting down.
    Shutdown,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vanished => write!(f, "connection file removed"),
            Self::Finished => write!(f, "monitor finished"),
            Self::Shutdown => write!(f, "daemon shutting down"),
        }
    }
}

// ============================================================================
// Session View
// ============================================================================

/// Snapshot of one registered monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub connection_file: PathBuf,
    pub state: SessionState,
    pub registered_at: DateTime<Utc>,
    /// False once the monitor task has ended but before it is pruned.
    pub running: bool,
}

impl SessionView {
    pub fn from_monitor(monitor: &MonitorHandle) -> Self {
        Self {
            id: monitor.session_id().clone(),
            connection_file: monitor.kernel().connection_file.clone(),
            state: monitor.state(),
            registered_at: monitor.started_at(),
            running: !monitor.is_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::Full { max: 256 };
        assert_eq!(err.to_string(), "registry is full (max: 256 sessions)");

        let err = RegistryError::SessionAlreadyMonitored(SessionId::new("abc"));
        assert_eq!(err.to_string(), "session already monitored: abc");

        assert_eq!(RegistryError::ChannelClosed.to_string(), "registry channel closed");
    }

    #[test]
    fn test_rejected_displays_its_error() {
        let rejected = Rejected {
            error: RegistryError::Full { max: 1 },
            monitor: None,
        };
        assert_eq!(rejected.to_string(), "registry is full (max: 1 sessions)");
    }

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::Vanished.to_string(), "connection file removed");
        assert_eq!(RemovalReason::Finished.to_string(), "monitor finished");
        assert_eq!(RemovalReason::Shutdown.to_string(), "daemon shutting down");
    }
}
