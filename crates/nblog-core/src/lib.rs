//! nblog Core - Shared types for Jupyter kernel execution logging
//!
//! This crate provides the domain types shared between the protocol
//! client (nblog-protocol) and the daemon (nblogd), plus the pure
//! message classifier that turns raw kernel messages into log records.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod channel;
pub mod classify;
pub mod error;
pub mod message;
pub mod record;
pub mod session;

// Re-exports for convenience
pub use channel::ChannelKind;
pub use classify::{classify, classify_broadcast, classify_control, classify_input};
pub use error::{DomainError, DomainResult};
pub use message::RawMessage;
pub use record::{LogRecord, RecordClock, RecordKind, ReplyStatus};
pub use session::{SessionId, SessionState};
