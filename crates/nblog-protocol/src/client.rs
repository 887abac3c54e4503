//! Channel and connector traits used by the session monitor.
//!
//! A [`KernelConnector`] turns a discovered [`KernelBundle`] into three
//! open [`KernelChannel`]s. The daemon only ever reads from them.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use nblog_core::{ChannelKind, RawMessage, SessionId};

use crate::connection::ConnectionError;
use crate::wire::WireError;

/// A discovered kernel: its id plus the credentials needed to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelBundle {
    pub id: SessionId,
    pub connection_file: PathBuf,
}

impl KernelBundle {
    pub fn new(id: impl Into<SessionId>, connection_file: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            connection_file: connection_file.into(),
        }
    }
}

/// Errors receiving from an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Socket-level failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message arrived but could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] WireError),

    /// The channel is closed and will not deliver further messages.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Returns true if retrying the receive can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Errors opening a kernel's channels.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid signing configuration: {0}")]
    Signing(#[from] WireError),

    #[error("failed to connect {channel} channel to {endpoint}: {message}")]
    Connect {
        channel: ChannelKind,
        endpoint: String,
        message: String,
    },

    #[error("kernel {0} refused the connection")]
    Refused(SessionId),
}

/// One receive-only kernel channel.
#[async_trait]
pub trait KernelChannel: Send {
    /// Which of the three channels this is.
    fn kind(&self) -> ChannelKind;

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. Must be cancel-safe:
    /// dropping the future never loses a message.
    async fn recv_timeout(&mut self, timeout: Duration)
        -> Result<Option<RawMessage>, ChannelError>;

    /// Releases the underlying socket. Further receives return `Closed`.
    async fn close(&mut self);
}

/// The three channels of one kernel.
pub struct KernelChannels {
    pub broadcast: Box<dyn KernelChannel>,
    pub control: Box<dyn KernelChannel>,
    pub input: Box<dyn KernelChannel>,
}

impl KernelChannels {
    /// Returns the channels in [`ChannelKind::ALL`] order.
    pub fn into_vec(self) -> Vec<Box<dyn KernelChannel>> {
        vec![self.broadcast, self.control, self.input]
    }
}

impl std::fmt::Debug for KernelChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelChannels")
            .field("broadcast", &self.broadcast.kind())
            .field("control", &self.control.kind())
            .field("input", &self.input.kind())
            .finish()
    }
}

/// Opens channels to a kernel.
#[async_trait]
pub trait KernelConnector: Send + Sync {
    async fn connect(&self, kernel: &KernelBundle) -> Result<KernelChannels, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_transience() {
        assert!(ChannelError::Transport("reset".to_string()).is_transient());
        assert!(ChannelError::Decode(WireError::BadSignature).is_transient());
        assert!(!ChannelError::Closed.is_transient());
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Connect {
            channel: ChannelKind::Control,
            endpoint: "tcp://127.0.0.1:1".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect control channel to tcp://127.0.0.1:1: connection refused"
        );
    }
}
