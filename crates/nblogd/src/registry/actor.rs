//! Registry actor - owns every running monitor handle.
//!
//! The actor is the single owner of the session → monitor mapping. A
//! monitor is released to connect only once it has been inserted, so a
//! rejected duplicate never touches the kernel. The actor never awaits a
//! monitor; handles that leave the registry are returned to the caller,
//! who stops them outside the actor.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nblog_core::SessionId;

use super::commands::{Rejected, RegistryCommand, RegistryError, RemovalReason, SessionView};
use crate::session::MonitorHandle;

/// Maximum number of kernels monitored at once.
pub const MAX_SESSIONS: usize = 256;

/// The registry actor.
///
/// Processes commands sequentially from its mpsc receiver, so every
/// check-then-insert is atomic with respect to other callers.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    monitors: HashMap<SessionId, MonitorHandle>,
}

impl RegistryActor {
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            receiver,
            monitors: HashMap::new(),
        }
    }

    /// Runs until every handle has been dropped.
    ///
    /// Monitors still registered at that point are told to stop.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        for monitor in self.monitors.values() {
            monitor.signal_stop();
        }
        info!(sessions = self.monitors.len(), "Registry actor stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                monitor,
                respond_to,
            } => {
                let result = self.handle_register(monitor);
                if let Err(Err(Rejected {
                    monitor: Some(monitor),
                    ..
                })) = respond_to.send(result)
                {
                    // Caller went away; nobody else will stop this monitor.
                    monitor.signal_stop();
                }
            }
            RegistryCommand::Deregister {
                session_id,
                reason,
                respond_to,
            } => {
                let removed = self.handle_deregister(&session_id, reason);
                if let Err(Some(monitor)) = respond_to.send(removed) {
                    monitor.signal_stop();
                }
            }
            RegistryCommand::PruneFinished { respond_to } => {
                let _ = respond_to.send(self.handle_prune_finished());
            }
            RegistryCommand::SessionIds { respond_to } => {
                let mut ids: Vec<SessionId> = self.monitors.keys().cloned().collect();
                ids.sort();
                let _ = respond_to.send(ids);
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let view = self.monitors.get(&session_id).map(SessionView::from_monitor);
                let _ = respond_to.send(view);
            }
            RegistryCommand::GetAllSessions { respond_to } => {
                let mut views: Vec<SessionView> =
                    self.monitors.values().map(SessionView::from_monitor).collect();
                views.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = respond_to.send(views);
            }
            RegistryCommand::Drain { respond_to } => {
                let drained: Vec<MonitorHandle> =
                    self.monitors.drain().map(|(_, monitor)| monitor).collect();
                info!(count = drained.len(), reason = %RemovalReason::Shutdown, "Registry drained");
                if let Err(drained) = respond_to.send(drained) {
                    for monitor in &drained {
                        monitor.signal_stop();
                    }
                }
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, monitor: Box<MonitorHandle>) -> Result<(), Rejected> {
        let session_id = monitor.session_id().clone();

        if self.monitors.contains_key(&session_id) {
            debug!(session_id = %session_id, "Session already monitored, rejecting registration");
            return Err(Rejected {
                error: RegistryError::SessionAlreadyMonitored(session_id),
                monitor: Some(monitor),
            });
        }

        if self.monitors.len() >= MAX_SESSIONS {
            warn!(
                session_id = %session_id,
                current = self.monitors.len(),
                max = MAX_SESSIONS,
                "Registry is full, rejecting registration"
            );
            return Err(Rejected {
                error: RegistryError::Full { max: MAX_SESSIONS },
                monitor: Some(monitor),
            });
        }

        let mut monitor = *monitor;
        monitor.start();
        self.monitors.insert(session_id.clone(), monitor);
        info!(
            session_id = %session_id,
            total_sessions = self.monitors.len(),
            "Session registered"
        );
        Ok(())
    }

    fn handle_deregister(
        &mut self,
        session_id: &SessionId,
        reason: RemovalReason,
    ) -> Option<Box<MonitorHandle>> {
        let monitor = self.monitors.remove(session_id)?;
        info!(
            session_id = %session_id,
            reason = %reason,
            remaining_sessions = self.monitors.len(),
            "Session deregistered"
        );
        Some(Box::new(monitor))
    }

    fn handle_prune_finished(&mut self) -> Vec<MonitorHandle> {
        let finished: Vec<SessionId> = self
            .monitors
            .iter()
            .filter(|(_, monitor)| monitor.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        if finished.is_empty() {
            return Vec::new();
        }

        let pruned: Vec<MonitorHandle> = finished
            .iter()
            .filter_map(|id| self.monitors.remove(id))
            .collect();
        debug!(
            count = pruned.len(),
            reason = %RemovalReason::Finished,
            remaining_sessions = self.monitors.len(),
            "Pruned finished monitors"
        );
        pruned
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.monitors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use nblog_core::{RecordClock, SessionState};
    use nblog_protocol::{KernelBundle, MemoryConnector};
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::session::{SessionConfig, SessionMonitor};
    use crate::sink::SinkHandle;

    fn create_actor() -> (mpsc::Sender<RegistryCommand>, RegistryActor) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (cmd_tx, RegistryActor::new(cmd_rx))
    }

    fn spawn_monitor(id: &str, connector: &MemoryConnector) -> Box<MonitorHandle> {
        let (tx, _rx) = mpsc::channel(16);
        let monitor = SessionMonitor::new(
            KernelBundle::new(id, format!("kernel-{id}.json")),
            Arc::new(connector.clone()),
            SinkHandle::from_sender(tx),
            RecordClock::new(),
            SessionConfig::default(),
        );
        Box::new(monitor.spawn(&CancellationToken::new()))
    }

    fn register(actor: &mut RegistryActor, monitor: Box<MonitorHandle>) -> Result<(), Rejected> {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Register {
            monitor,
            respond_to: tx,
        });
        rx.try_recv().expect("no response")
    }

    #[tokio::test]
    async fn test_register_session() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();

        assert!(register(&mut actor, spawn_monitor("k1", &connector)).is_ok());
        assert_eq!(actor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_register_duplicate_returns_monitor() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();

        register(&mut actor, spawn_monitor("k1", &connector)).unwrap();
        let rejected = register(&mut actor, spawn_monitor("k1", &connector)).unwrap_err();

        assert_eq!(
            rejected.error,
            RegistryError::SessionAlreadyMonitored(SessionId::new("k1"))
        );
        let monitor = rejected.monitor.expect("monitor handed back");
        assert_eq!(monitor.session_id().as_str(), "k1");
        assert_eq!(actor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_capacity() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();

        for i in 0..MAX_SESSIONS {
            register(&mut actor, spawn_monitor(&format!("k{i}"), &connector)).unwrap();
        }
        let rejected = register(&mut actor, spawn_monitor("overflow", &connector)).unwrap_err();
        assert_eq!(rejected.error, RegistryError::Full { max: MAX_SESSIONS });
        assert!(rejected.monitor.is_some());
    }

    #[tokio::test]
    async fn test_deregister_hands_back_monitor() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();
        register(&mut actor, spawn_monitor("k1", &connector)).unwrap();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Deregister {
            session_id: SessionId::new("k1"),
            reason: RemovalReason::Vanished,
            respond_to: tx,
        });
        let monitor = rx.try_recv().unwrap().expect("monitor removed");
        assert_eq!(actor.session_count(), 0);
        monitor.stop(Duration::from_secs(1)).await;

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Deregister {
            session_id: SessionId::new("k1"),
            reason: RemovalReason::Vanished,
            respond_to: tx,
        });
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_finished_only_removes_ended_monitors() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();
        connector.refuse("dead");

        register(&mut actor, spawn_monitor("alive", &connector)).unwrap();
        register(&mut actor, spawn_monitor("dead", &connector)).unwrap();

        // The refused monitor ends right after its connect attempt.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !actor.monitors[&SessionId::new("dead")].is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::PruneFinished { respond_to: tx });
        let pruned = rx.try_recv().unwrap();

        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].session_id().as_str(), "dead");
        assert_eq!(actor.session_count(), 1);
    }

    #[tokio::test]
    async fn test_views_are_sorted() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();
        for id in ["c", "a", "b"] {
            register(&mut actor, spawn_monitor(id, &connector)).unwrap();
        }

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::GetAllSessions { respond_to: tx });
        let ids: Vec<String> = rx
            .try_recv()
            .unwrap()
            .into_iter()
            .map(|view| view.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::GetSession {
            session_id: SessionId::new("b"),
            respond_to: tx,
        });
        let view = rx.try_recv().unwrap().unwrap();
        assert_eq!(view.connection_file.to_str(), Some("kernel-b.json"));
        assert_ne!(view.state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let (_tx, mut actor) = create_actor();
        let connector = MemoryConnector::new();
        register(&mut actor, spawn_monitor("k1", &connector)).unwrap();
        register(&mut actor, spawn_monitor("k2", &connector)).unwrap();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Drain { respond_to: tx });
        let drained = rx.try_recv().unwrap();

        assert_eq!(drained.len(), 2);
        assert_eq!(actor.session_count(), 0);
        for monitor in drained {
            monitor.stop(Duration::from_secs(1)).await;
        }
    }
}
