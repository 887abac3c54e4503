//! Session monitor - owns one kernel's three channel pollers.
//!
//! A spawned monitor waits until it is released with
//! [`MonitorHandle::start`], then connects, spawns a poller per channel
//! under a child token, and ends on stop or as soon as any poller ends.
//! It never interprets messages itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nblog_core::{ChannelKind, RecordClock, SessionId, SessionState};
use nblog_protocol::{ClientError, KernelBundle, KernelConnector};

use crate::poller::{ChannelPoller, PollerConfig, PollerExit};
use crate::sink::SinkHandle;

/// Per-session timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub poller: PollerConfig,
    pub connect_timeout: Duration,
    /// How long stopped pollers get to finish before they are abandoned.
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            connect_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Per-session startup failures. The session is retried on a later pass.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to connect to kernel {session_id}: {source}")]
    Connect {
        session_id: SessionId,
        #[source]
        source: ClientError,
    },

    #[error("timed out connecting to kernel {session_id} after {timeout_ms}ms")]
    ConnectTimeout { session_id: SessionId, timeout_ms: u64 },
}

/// How a monitor that connected successfully came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stop was requested.
    Stopped,
    /// A channel closed on its own; the kernel is likely gone.
    ChannelClosed(ChannelKind),
    /// The log sink stopped accepting records.
    SinkClosed,
    /// A poller task panicked.
    PollerFailed,
}

/// Result of [`MonitorHandle::stop`].
#[derive(Debug)]
pub enum StopOutcome {
    Stopped(MonitorExit),
    Failed(MonitorError),
    /// The monitor did not finish within the grace period and was abandoned.
    TimedOut,
    Panicked,
}

/// A not-yet-started monitor for one kernel.
pub struct SessionMonitor {
    kernel: KernelBundle,
    connector: Arc<dyn KernelConnector>,
    sink: SinkHandle,
    clock: RecordClock,
    config: SessionConfig,
}

impl SessionMonitor {
    pub fn new(
        kernel: KernelBundle,
        connector: Arc<dyn KernelConnector>,
        sink: SinkHandle,
        clock: RecordClock,
        config: SessionConfig,
    ) -> Self {
        Self {
            kernel,
            connector,
            sink,
            clock,
            config,
        }
    }

    /// Spawns the monitor task, stopping when `parent` is cancelled.
    ///
    /// The task does not connect until [`MonitorHandle::start`] is called.
    pub fn spawn(self, parent: &CancellationToken) -> MonitorHandle {
        let cancel = parent.child_token();
        let (state_tx, state_rx) = watch::channel(SessionState::Discovered);
        let (gate_tx, gate_rx) = oneshot::channel();
        let kernel = self.kernel.clone();
        let task = tokio::spawn(self.run(cancel.clone(), gate_rx, state_tx));

        MonitorHandle {
            kernel,
            cancel,
            gate: Some(gate_tx),
            task,
            state: state_rx,
            started_at: Utc::now(),
        }
    }

    async fn run(
        self,
        cancel: CancellationToken,
        gate: oneshot::Receiver<()>,
        state: watch::Sender<SessionState>,
    ) -> Result<MonitorExit, MonitorError> {
        let result = self.monitor(&cancel, gate, &state).await;
        state.send_replace(SessionState::Stopped);
        result
    }

    async fn monitor(
        &self,
        cancel: &CancellationToken,
        gate: oneshot::Receiver<()>,
        state: &watch::Sender<SessionState>,
    ) -> Result<MonitorExit, MonitorError> {
        let session_id = &self.kernel.id;
        let timeout = self.config.connect_timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(MonitorExit::Stopped),
            released = gate => {
                if released.is_err() {
                    // Handle dropped before start.
                    return Ok(MonitorExit::Stopped);
                }
            }
        }

        let channels = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(MonitorExit::Stopped),
            connected = tokio::time::timeout(timeout, self.connector.connect(&self.kernel)) => {
                match connected {
                    Ok(Ok(channels)) => channels,
                    Ok(Err(source)) => {
                        return Err(MonitorError::Connect {
                            session_id: session_id.clone(),
                            source,
                        })
                    }
                    Err(_) => {
                        return Err(MonitorError::ConnectTimeout {
                            session_id: session_id.clone(),
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        })
                    }
                }
            }
        };

        state.send_replace(SessionState::Monitoring);
        info!(
            session_id = %session_id,
            connection_file = %self.kernel.connection_file.display(),
            "Monitoring kernel"
        );

        let pollers = cancel.child_token();
        let mut tasks = JoinSet::new();
        for channel in channels.into_vec() {
            let poller = ChannelPoller::new(
                session_id.clone(),
                channel,
                self.sink.clone(),
                self.clock,
                self.config.poller,
            );
            tasks.spawn(poller.run(pollers.clone()));
        }

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => MonitorExit::Stopped,
            first = tasks.join_next() => match first {
                Some(Ok(report)) => match report.exit {
                    PollerExit::Cancelled => MonitorExit::Stopped,
                    PollerExit::ChannelClosed => MonitorExit::ChannelClosed(report.channel),
                    PollerExit::SinkClosed => MonitorExit::SinkClosed,
                },
                Some(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, "Channel poller failed");
                    MonitorExit::PollerFailed
                }
                None => MonitorExit::Stopped,
            },
        };

        pollers.cancel();
        let grace = self.config.shutdown_grace;
        let joined = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    debug!(session_id = %session_id, error = %e, "Channel poller failed during stop");
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                session_id = %session_id,
                remaining = tasks.len(),
                grace_ms = grace.as_millis(),
                "Abandoning channel pollers that did not stop in time"
            );
            tasks.detach_all();
        }

        info!(session_id = %session_id, exit = ?exit, "Kernel monitor stopped");
        Ok(exit)
    }
}

/// Handle to a running monitor, held by the registry.
#[derive(Debug)]
pub struct MonitorHandle {
    kernel: KernelBundle,
    cancel: CancellationToken,
    gate: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<MonitorExit, MonitorError>>,
    state: watch::Receiver<SessionState>,
    started_at: DateTime<Utc>,
}

impl MonitorHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.kernel.id
    }

    pub fn kernel(&self) -> &KernelBundle {
        &self.kernel
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Lets the monitor connect. Returns false if it was already started.
    pub fn start(&mut self) -> bool {
        self.gate.take().is_some_and(|gate| gate.send(()).is_ok())
    }

    /// Returns true once the monitor task has ended, for any reason.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Requests a stop without waiting. Repeated calls are harmless.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    /// Signals stop, then waits up to `grace` for the monitor to finish.
    pub async fn stop(mut self, grace: Duration) -> StopOutcome {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(Ok(exit))) => StopOutcome::Stopped(exit),
            Ok(Ok(Err(e))) => StopOutcome::Failed(e),
            Ok(Err(_)) => StopOutcome::Panicked,
            Err(_) => {
                warn!(
                    session_id = %self.kernel.id,
                    grace_ms = grace.as_millis(),
                    "Kernel monitor did not stop in time, abandoning it"
                );
                StopOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nblog_core::{LogRecord, RawMessage};
    use nblog_protocol::{ChannelError, KernelChannel, KernelChannels, MemoryConnector};
    use serde_json::json;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast() -> SessionConfig {
        SessionConfig {
            poller: PollerConfig {
                recv_timeout: Duration::from_millis(10),
                idle_interval: Duration::from_millis(1),
                error_backoff: Duration::from_millis(1),
            },
            connect_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    fn monitor(
        id: &str,
        connector: Arc<dyn KernelConnector>,
    ) -> (SessionMonitor, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(64);
        let kernel = KernelBundle::new(id, format!("/tmp/kernel-{id}.json"));
        let monitor = SessionMonitor::new(
            kernel,
            connector,
            SinkHandle::from_sender(tx),
            RecordClock::new(),
            fast(),
        );
        (monitor, rx)
    }

    async fn wait_for_state(handle: &MonitorHandle, want: SessionState) {
        let mut state = handle.state.clone();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .expect("monitor dropped its state");
    }

    struct HangingConnector;

    #[async_trait]
    impl KernelConnector for HangingConnector {
        async fn connect(&self, _kernel: &KernelBundle) -> Result<KernelChannels, ClientError> {
            std::future::pending().await
        }
    }

    /// A quiet channel whose `close` never returns.
    struct StuckOnCloseChannel(ChannelKind);

    #[async_trait]
    impl KernelChannel for StuckOnCloseChannel {
        fn kind(&self) -> ChannelKind {
            self.0
        }

        async fn recv_timeout(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<RawMessage>, ChannelError> {
            tokio::time::sleep(timeout).await;
            Ok(None)
        }

        async fn close(&mut self) {
            std::future::pending::<()>().await
        }
    }

    struct StuckOnCloseConnector;

    #[async_trait]
    impl KernelConnector for StuckOnCloseConnector {
        async fn connect(&self, _kernel: &KernelBundle) -> Result<KernelChannels, ClientError> {
            Ok(KernelChannels {
                broadcast: Box::new(StuckOnCloseChannel(ChannelKind::Broadcast)),
                control: Box::new(StuckOnCloseChannel(ChannelKind::Control)),
                input: Box::new(StuckOnCloseChannel(ChannelKind::Input)),
            })
        }
    }

    #[tokio::test]
    async fn test_monitor_forwards_every_channel() {
        let connector = MemoryConnector::new();
        let (monitor, mut rx) = monitor("k1", Arc::new(connector.clone()));
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();
        wait_for_state(&handle, SessionState::Monitoring).await;

        let id = SessionId::new("k1");
        assert!(connector.push(&id, ChannelKind::Broadcast, RawMessage::new("execute_input", json!({"code": "1"}))));
        assert!(connector.push(&id, ChannelKind::Control, RawMessage::new("execute_reply", json!({"status": "ok"}))));
        assert!(connector.push(&id, ChannelKind::Input, RawMessage::new("input_request", json!({"prompt": "> "}))));

        let mut channels = Vec::new();
        for _ in 0..3 {
            let record = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(record.session_id, id);
            channels.push(record.channel);
        }
        channels.sort_by_key(|c| c.as_str());
        let mut expected = ChannelKind::ALL.to_vec();
        expected.sort_by_key(|c| c.as_str());
        assert_eq!(channels, expected);

        match handle.stop(WAIT).await {
            StopOutcome::Stopped(MonitorExit::Stopped) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refused_connect_is_a_session_error() {
        let connector = MemoryConnector::new();
        connector.refuse("k1");
        let (monitor, _rx) = monitor("k1", Arc::new(connector));
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();

        wait_for_state(&handle, SessionState::Stopped).await;
        assert!(matches!(
            handle.stop(WAIT).await,
            StopOutcome::Failed(MonitorError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (monitor, _rx) = monitor("slow", Arc::new(HangingConnector));
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();

        wait_for_state(&handle, SessionState::Stopped).await;
        assert!(matches!(
            handle.stop(WAIT).await,
            StopOutcome::Failed(MonitorError::ConnectTimeout { timeout_ms: 200, .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_during_connect() {
        let (mut monitor, _rx) = monitor("slow", Arc::new(HangingConnector));
        monitor.config.connect_timeout = Duration::from_secs(60);
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();

        assert!(matches!(
            handle.stop(WAIT).await,
            StopOutcome::Stopped(MonitorExit::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_unstarted_monitor_never_connects() {
        let connector = MemoryConnector::new();
        let (monitor, _rx) = monitor("k1", Arc::new(connector.clone()));
        let handle = monitor.spawn(&CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), SessionState::Discovered);
        assert!(matches!(
            handle.stop(WAIT).await,
            StopOutcome::Stopped(MonitorExit::Stopped)
        ));
        assert_eq!(connector.connect_count(&SessionId::new("k1")), 0);
    }

    #[tokio::test]
    async fn test_start_is_one_shot() {
        let connector = MemoryConnector::new();
        let (monitor, _rx) = monitor("k1", Arc::new(connector));
        let mut handle = monitor.spawn(&CancellationToken::new());

        assert!(handle.start());
        assert!(!handle.start());
        handle.stop(WAIT).await;
    }

    #[tokio::test]
    async fn test_severed_kernel_ends_monitor() {
        let connector = MemoryConnector::new();
        let (monitor, _rx) = monitor("k1", Arc::new(connector.clone()));
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();
        wait_for_state(&handle, SessionState::Monitoring).await;

        connector.sever(&SessionId::new("k1"));
        wait_for_state(&handle, SessionState::Stopped).await;

        assert!(matches!(
            handle.stop(WAIT).await,
            StopOutcome::Stopped(MonitorExit::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_monitor() {
        let connector = MemoryConnector::new();
        let root = CancellationToken::new();
        let (monitor, _rx) = monitor("k1", Arc::new(connector.clone()));
        let mut handle = monitor.spawn(&root);
        handle.start();
        wait_for_state(&handle, SessionState::Monitoring).await;

        root.cancel();
        wait_for_state(&handle, SessionState::Stopped).await;
        assert!(!connector.is_connected(&SessionId::new("k1")));
    }

    #[tokio::test]
    async fn test_pollers_stuck_in_close_are_abandoned_after_grace() {
        let (mut monitor, _rx) = monitor("stuck", Arc::new(StuckOnCloseConnector));
        monitor.config.shutdown_grace = Duration::from_millis(200);
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();
        wait_for_state(&handle, SessionState::Monitoring).await;

        let started = tokio::time::Instant::now();
        let outcome = handle.stop(WAIT).await;
        let elapsed = started.elapsed();

        assert!(
            matches!(outcome, StopOutcome::Stopped(MonitorExit::Stopped)),
            "unexpected outcome: {outcome:?}"
        );
        assert!(elapsed >= Duration::from_millis(200), "stopped before grace: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "stop overran grace: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_in_flight_records_do_not_delay_stop() {
        let connector = MemoryConnector::new();
        let (monitor, rx) = monitor("busy", Arc::new(connector.clone()));
        let mut handle = monitor.spawn(&CancellationToken::new());
        handle.start();
        wait_for_state(&handle, SessionState::Monitoring).await;

        // Nothing drains the sink, so pollers end up blocked on a full buffer.
        let id = SessionId::new("busy");
        for i in 0..200 {
            connector.push(&id, ChannelKind::Broadcast, RawMessage::new("stream", json!({"text": i.to_string()})));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = tokio::time::timeout(WAIT, handle.stop(WAIT)).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped(MonitorExit::Stopped)));
        drop(rx);
    }
}
