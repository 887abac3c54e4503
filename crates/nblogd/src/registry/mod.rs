//! Monitor registry using the actor pattern.
//!
//! The registry maps each kernel's session id to its running monitor and
//! is the only state shared between the discovery loop and status queries.
//! All mutation happens inside one actor task, which keeps "at most one
//! monitor per session" true even when discovery passes overlap.
//!
//! ```text
//! ┌────────────────┐  RegistryCommand  ┌────────────────┐
//! │ DiscoveryLoop  │──────────────────▶│ RegistryActor  │
//! └────────────────┘   (mpsc channel)  └────────────────┘
//!         ▲                                    │
//!         │  rejected / removed MonitorHandle  │
//!         └────────────────────────────────────┘
//!                (oneshot responses)
//! ```
//!
//! Handles leaving the registry are returned to the caller, so stopping
//! a slow monitor never blocks the actor.

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_SESSIONS};
pub use commands::{Rejected, RegistryCommand, RegistryError, RemovalReason, SessionView};
pub use handle::RegistryHandle;

const COMMAND_BUFFER: usize = 64;

/// Spawns the registry actor and returns a handle to it.
///
/// The actor stops once every clone of the handle has been dropped.
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(RegistryActor::new(cmd_rx).run());
    RegistryHandle::new(cmd_tx)
}
