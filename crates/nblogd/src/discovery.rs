//! Kernel discovery - keeps one monitor running per live kernel.
//!
//! Each pass prunes monitors that ended on their own, scans the Jupyter
//! runtime directory for `kernel-*.json` connection files, stops monitors
//! whose file has gone, and starts monitors for new files.
//!
//! # Async Safety
//!
//! Directory scans run via `spawn_blocking`.
//!
//! # Error Policy
//!
//! Scan failures skip the pass and per-session failures are retried on
//! the next one. Only losing the registry ends the loop.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nblog_core::{RecordClock, SessionId};
use nblog_protocol::{KernelBundle, KernelConnector};

use crate::registry::{Rejected, RegistryError, RegistryHandle, RemovalReason};
use crate::session::{MonitorExit, MonitorHandle, SessionConfig, SessionMonitor, StopOutcome};
use crate::sink::SinkHandle;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The runtime directory exists but could not be listed.
    #[error("failed to read {}: {message}", path.display())]
    ReadDir { path: PathBuf, message: String },

    /// The blocking scan task panicked.
    #[error("runtime directory scan panicked: {0}")]
    ScanPanicked(String),

    /// The registry actor has stopped. Fatal for the loop.
    #[error("monitor registry is unavailable")]
    RegistryUnavailable,
}

impl From<RegistryError> for DiscoveryError {
    fn from(_: RegistryError) -> Self {
        Self::RegistryUnavailable
    }
}

// ============================================================================
// Result And Config
// ============================================================================

/// Counts from one or more discovery passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    /// Monitors started for newly seen kernels.
    pub discovered: u32,
    /// Monitors stopped because their connection file vanished.
    pub stopped: u32,
    /// Monitors removed after ending on their own.
    pub pruned: u32,
    /// Kernels that could not be registered.
    pub failed: u32,
}

impl DiscoveryResult {
    fn absorb(&mut self, pass: DiscoveryResult) {
        self.discovered += pass.discovered;
        self.stopped += pass.stopped;
        self.pruned += pass.pruned;
        self.failed += pass.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    /// Time each monitor gets to stop.
    pub shutdown_grace: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

// ============================================================================
// Session Sources
// ============================================================================

/// Yields the kernels that are currently available.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn scan(&self) -> Result<Vec<KernelBundle>, DiscoveryError>;
}

/// Lists `kernel-<id>.json` files in a Jupyter runtime directory.
#[derive(Debug, Clone)]
pub struct RuntimeDirSource {
    dir: PathBuf,
}

impl RuntimeDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SessionSource for RuntimeDirSource {
    async fn scan(&self) -> Result<Vec<KernelBundle>, DiscoveryError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || scan_runtime_dir(&dir))
            .await
            .map_err(|e| DiscoveryError::ScanPanicked(e.to_string()))?
    }
}

/// Scans `dir` for connection files, sorted by session id.
///
/// A missing directory means no kernels are running yet.
fn scan_runtime_dir(dir: &Path) -> Result<Vec<KernelBundle>, DiscoveryError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(DiscoveryError::ReadDir {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })
        }
    };

    let mut kernels: Vec<KernelBundle> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let id = SessionId::from_connection_file_name(path.file_name()?.to_str()?).ok()?;
            path.is_file().then(|| KernelBundle::new(id, path))
        })
        .collect();

    kernels.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(kernels)
}

// ============================================================================
// Discovery Loop
// ============================================================================

/// Periodically reconciles running monitors with available kernels.
pub struct DiscoveryLoop {
    source: Arc<dyn SessionSource>,
    connector: Arc<dyn KernelConnector>,
    registry: RegistryHandle,
    sink: SinkHandle,
    clock: RecordClock,
    config: DiscoveryConfig,
    session: SessionConfig,
}

impl DiscoveryLoop {
    pub fn new(
        source: Arc<dyn SessionSource>,
        connector: Arc<dyn KernelConnector>,
        registry: RegistryHandle,
        sink: SinkHandle,
        config: DiscoveryConfig,
        session: SessionConfig,
    ) -> Self {
        Self {
            source,
            connector,
            registry,
            sink,
            clock: RecordClock::new(),
            config,
            session,
        }
    }

    /// Uses `clock` for record timestamps instead of a fresh one.
    #[must_use]
    pub fn with_clock(mut self, clock: RecordClock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs passes until `cancel` fires, then stops every monitor.
    ///
    /// # Errors
    ///
    /// `DiscoveryError::RegistryUnavailable` if the registry actor stops.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DiscoveryResult, DiscoveryError> {
        info!(
            interval_ms = self.config.interval.as_millis(),
            "Discovery loop starting"
        );

        let mut totals = DiscoveryResult::default();
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }

            match self.reconcile(&cancel).await {
                Ok(pass) => totals.absorb(pass),
                Err(e) => break Err(e),
            }
        };

        self.shutdown().await;
        info!(
            discovered = totals.discovered,
            stopped = totals.stopped,
            pruned = totals.pruned,
            failed = totals.failed,
            "Discovery loop stopped"
        );
        outcome.map(|()| totals)
    }

    /// Runs a single discovery pass.
    ///
    /// New monitors are children of `cancel`.
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let mut pass = DiscoveryResult::default();
        let grace = self.config.shutdown_grace;

        for finished in self.registry.prune_finished().await? {
            pass.pruned += 1;
            stop_monitor(finished, grace).await;
        }

        let kernels = match self.source.scan().await {
            Ok(kernels) => kernels,
            Err(e) => {
                warn!(error = %e, "Kernel scan failed, skipping pass");
                return Ok(pass);
            }
        };
        let present: HashSet<&SessionId> = kernels.iter().map(|k| &k.id).collect();
        let registered: HashSet<SessionId> =
            self.registry.session_ids().await?.into_iter().collect();

        let mut stopping = JoinSet::new();
        for id in registered.iter().filter(|id| !present.contains(id)) {
            if let Some(monitor) = self
                .registry
                .deregister(id.clone(), RemovalReason::Vanished)
                .await?
            {
                info!(session_id = %id, "Kernel connection file removed");
                pass.stopped += 1;
                stopping.spawn(stop_monitor(monitor, grace));
            }
        }

        for kernel in kernels {
            if registered.contains(&kernel.id) {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            let session_id = kernel.id.clone();
            let monitor = SessionMonitor::new(
                kernel,
                Arc::clone(&self.connector),
                self.sink.clone(),
                self.clock,
                self.session,
            )
            .spawn(cancel);

            match self.registry.register(monitor).await {
                Ok(()) => {
                    info!(session_id = %session_id, "New kernel discovered");
                    pass.discovered += 1;
                }
                Err(Rejected { error, monitor }) => {
                    if let Some(monitor) = monitor {
                        monitor.signal_stop();
                    }
                    match error {
                        RegistryError::SessionAlreadyMonitored(_) => {
                            debug!(session_id = %session_id, "Kernel registered by a concurrent pass");
                        }
                        RegistryError::Full { max } => {
                            warn!(session_id = %session_id, max, "Too many kernels, not monitoring");
                            pass.failed += 1;
                        }
                        RegistryError::ChannelClosed => return Err(DiscoveryError::RegistryUnavailable),
                    }
                }
            }
        }

        while stopping.join_next().await.is_some() {}

        debug!(
            discovered = pass.discovered,
            stopped = pass.stopped,
            pruned = pass.pruned,
            failed = pass.failed,
            "Discovery pass complete"
        );
        Ok(pass)
    }

    /// Drains the registry and stops every monitor concurrently.
    async fn shutdown(&self) {
        let monitors = match self.registry.drain().await {
            Ok(monitors) => monitors,
            Err(e) => {
                warn!(error = %e, "Registry unavailable during shutdown");
                return;
            }
        };

        let count = monitors.len();
        let mut stopping = JoinSet::new();
        for monitor in monitors {
            stopping.spawn(stop_monitor(monitor, self.config.shutdown_grace));
        }

        let mut abandoned = 0usize;
        while let Some(joined) = stopping.join_next().await {
            if matches!(joined, Ok(StopOutcome::TimedOut) | Err(_)) {
                abandoned += 1;
            }
        }
        info!(count, abandoned, "Kernel monitors stopped");
    }
}

/// Stops a monitor and logs how it ended.
async fn stop_monitor(monitor: MonitorHandle, grace: Duration) -> StopOutcome {
    let session_id = monitor.session_id().clone();
    let outcome = monitor.stop(grace).await;

    match &outcome {
        StopOutcome::Stopped(MonitorExit::Stopped) => {}
        StopOutcome::Stopped(MonitorExit::ChannelClosed(channel)) => {
            info!(session_id = %session_id, channel = %channel, "Kernel channel closed, will reconnect if still present");
        }
        StopOutcome::Stopped(exit) => {
            warn!(session_id = %session_id, exit = ?exit, "Kernel monitor ended");
        }
        StopOutcome::Failed(e) => {
            warn!(session_id = %session_id, error = %e, "Kernel monitor failed, will retry");
        }
        StopOutcome::TimedOut => {}
        StopOutcome::Panicked => {
            warn!(session_id = %session_id, "Kernel monitor panicked");
        }
    }
    outcome
}
