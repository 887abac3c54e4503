//! Channel poller - one per channel per kernel.
//!
//! Receives with a bounded wait, classifies, and forwards to the sink.
//! Every wait is raced against the stop token, so a silent kernel never
//! delays shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use nblog_core::{classify, ChannelKind, LogRecord, RecordClock, SessionId};
use nblog_protocol::{ChannelError, KernelChannel};

use crate::sink::SinkHandle;

/// Poller timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Longest single wait for a message.
    pub recv_timeout: Duration,
    /// Pause after a receive that returned nothing.
    pub idle_interval: Duration,
    /// Pause after a transient channel error.
    pub error_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(100),
            idle_interval: Duration::from_millis(10),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// The stop token fired.
    Cancelled,
    /// The channel reported it will deliver nothing more.
    ChannelClosed,
    /// The sink stopped accepting records.
    SinkClosed,
}

/// Summary returned when a poller finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerReport {
    pub channel: ChannelKind,
    pub exit: PollerExit,
    pub messages: u64,
    pub errors: u64,
}

/// Polls one kernel channel until stopped.
pub struct ChannelPoller {
    session_id: SessionId,
    channel: Box<dyn KernelChannel>,
    sink: SinkHandle,
    clock: RecordClock,
    config: PollerConfig,
}

impl ChannelPoller {
    pub fn new(
        session_id: SessionId,
        channel: Box<dyn KernelChannel>,
        sink: SinkHandle,
        clock: RecordClock,
        config: PollerConfig,
    ) -> Self {
        Self {
            session_id,
            channel,
            sink,
            clock,
            config,
        }
    }

    /// Runs the receive loop, then closes the channel.
    pub async fn run(mut self, cancel: CancellationToken) -> PollerReport {
        let kind = self.channel.kind();
        let mut messages = 0u64;
        let mut errors = 0u64;

        debug!(session_id = %self.session_id, channel = %kind, "Channel poller started");

        let exit = loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PollerExit::Cancelled,
                received = self.channel.recv_timeout(self.config.recv_timeout) => received,
            };

            match received {
                Ok(Some(msg)) => {
                    messages += 1;
                    trace!(
                        session_id = %self.session_id,
                        channel = %kind,
                        msg_type = %msg.msg_type,
                        "Message received"
                    );
                    let record =
                        LogRecord::new(&self.clock, self.session_id.clone(), kind, classify(&msg, kind));

                    let submitted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break PollerExit::Cancelled,
                        submitted = self.sink.submit(record) => submitted,
                    };
                    if submitted.is_err() {
                        break PollerExit::SinkClosed;
                    }
                }
                Ok(None) => {
                    if !pause(self.config.idle_interval, &cancel).await {
                        break PollerExit::Cancelled;
                    }
                }
                Err(ChannelError::Closed) => break PollerExit::ChannelClosed,
                Err(e) => {
                    errors += 1;
                    debug!(
                        session_id = %self.session_id,
                        channel = %kind,
                        error = %e,
                        "Transient channel error"
                    );
                    if !pause(self.config.error_backoff, &cancel).await {
                        break PollerExit::Cancelled;
                    }
                }
            }
        };

        self.channel.close().await;
        debug!(
            session_id = %self.session_id,
            channel = %kind,
            exit = ?exit,
            messages,
            errors,
            "Channel poller stopped"
        );

        PollerReport {
            channel: kind,
            exit,
            messages,
            errors,
        }
    }
}

/// Sleeps for `duration`; returns false if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
