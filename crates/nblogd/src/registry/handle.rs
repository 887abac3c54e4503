//! Client interface for the registry actor.
//!
//! `RegistryHandle` is cheap to clone and shared by the discovery loop and
//! status queries. Channel failures map to `RegistryError::ChannelClosed`.

use tokio::sync::{mpsc, oneshot};

use nblog_core::SessionId;

use super::commands::{Rejected, RegistryCommand, RegistryError, RemovalReason, SessionView};
use crate::session::MonitorHandle;

/// Handle for interacting with the registry actor.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Registers a running monitor.
    ///
    /// # Errors
    ///
    /// On rejection the monitor comes back inside [`Rejected`] so the
    /// caller can stop it.
    pub async fn register(&self, monitor: MonitorHandle) -> Result<(), Rejected> {
        let (tx, rx) = oneshot::channel();

        if let Err(mpsc::error::SendError(cmd)) = self
            .sender
            .send(RegistryCommand::Register {
                monitor: Box::new(monitor),
                respond_to: tx,
            })
            .await
        {
            let monitor = match cmd {
                RegistryCommand::Register { monitor, .. } => Some(monitor),
                _ => None,
            };
            return Err(Rejected {
                error: RegistryError::ChannelClosed,
                monitor,
            });
        }

        rx.await.unwrap_or(Err(Rejected {
            error: RegistryError::ChannelClosed,
            monitor: None,
        }))
    }

    /// Removes a monitor and returns it, or `None` if none was registered.
    pub async fn deregister(
        &self,
        session_id: SessionId,
        reason: RemovalReason,
    ) -> Result<Option<MonitorHandle>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Deregister {
                session_id,
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        let removed = rx.await.map_err(|_| RegistryError::ChannelClosed)?;
        Ok(removed.map(|monitor| *monitor))
    }

    /// Removes and returns every monitor whose task has ended.
    pub async fn prune_finished(&self) -> Result<Vec<MonitorHandle>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::PruneFinished { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Sorted ids of all registered monitors.
    pub async fn session_ids(&self) -> Result<Vec<SessionId>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::SessionIds { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Get a single session view.
    ///
    /// Returns `None` if the session is not registered or the actor is gone.
    pub async fn get_session(&self, session_id: SessionId) -> Option<SessionView> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetSession {
                session_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// All session views, sorted by id. Empty if the actor is gone.
    pub async fn list_sessions(&self) -> Vec<SessionView> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::GetAllSessions { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Removes and returns every monitor.
    pub async fn drain(&self) -> Result<Vec<MonitorHandle>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Drain { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use nblog_core::RecordClock;
    use nblog_protocol::{KernelBundle, MemoryConnector};
    use tokio_util::sync::CancellationToken;

    use crate::registry::spawn_registry;
    use crate::session::{SessionConfig, SessionMonitor};
    use crate::sink::SinkHandle;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (RegistryHandle::new(cmd_tx), cmd_rx)
    }

    fn spawn_monitor(id: &str) -> MonitorHandle {
        let (tx, _rx) = mpsc::channel(16);
        SessionMonitor::new(
            KernelBundle::new(id, format!("kernel-{id}.json")),
            Arc::new(MemoryConnector::new()),
            SinkHandle::from_sender(tx),
            RecordClock::new(),
            SessionConfig::default(),
        )
        .spawn(&CancellationToken::new())
    }

    #[tokio::test]
    async fn test_register_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Register {
                monitor,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(monitor.session_id().as_str(), "k1");
                let _ = respond_to.send(Ok(()));
                return true;
            }
            false
        });

        assert!(handle.register(spawn_monitor("k1")).await.is_ok());
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_register_after_actor_stopped_returns_monitor() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let rejected = handle.register(spawn_monitor("k1")).await.unwrap_err();
        assert_eq!(rejected.error, RegistryError::ChannelClosed);

        let monitor = rejected.monitor.expect("monitor recovered from the send error");
        monitor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_queries_after_actor_stopped() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert_eq!(handle.session_ids().await, Err(RegistryError::ChannelClosed));
        assert!(handle.list_sessions().await.is_empty());
        assert!(handle.get_session(SessionId::new("k1")).await.is_none());
        assert!(matches!(
            handle.drain().await,
            Err(RegistryError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_through_actor() {
        let handle = spawn_registry();

        handle.register(spawn_monitor("b")).await.unwrap();
        handle.register(spawn_monitor("a")).await.unwrap();
        assert_eq!(
            handle.session_ids().await.unwrap(),
            vec![SessionId::new("a"), SessionId::new("b")]
        );

        let removed = handle
            .deregister(SessionId::new("a"), RemovalReason::Vanished)
            .await
            .unwrap()
            .expect("registered");
        removed.stop(Duration::from_secs(1)).await;

        let view = handle.get_session(SessionId::new("b")).await.unwrap();
        assert!(view.running);
        assert_eq!(handle.list_sessions().await.len(), 1);

        let drained = handle.drain().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(handle.session_ids().await.unwrap().is_empty());
    }
}
