//! Optional `jupyter notebook` child process.
//!
//! Started before discovery when `[server] launch = true`, and terminated
//! after every monitor has stopped.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("notebook server exited during startup ({status})")]
    ExitedEarly { status: ExitStatus },
}

/// A running notebook server owned by the daemon.
#[derive(Debug)]
pub struct NotebookServer {
    child: Child,
}

impl NotebookServer {
    /// Spawns the server and waits out its startup delay.
    ///
    /// # Errors
    ///
    /// Fails if the program cannot be spawned or exits before the delay ends.
    pub async fn launch(config: &ServerConfig) -> Result<Self, LaunchError> {
        let mut child = Command::new(&config.command)
            .arg("notebook")
            .arg("--notebook-dir")
            .arg(&config.notebook_dir)
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--no-browser")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        info!(
            pid = child.id(),
            port = config.port,
            notebook_dir = %config.notebook_dir.display(),
            "Notebook server starting"
        );

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => return Err(LaunchError::ExitedEarly { status }),
                    Err(e) => warn!(error = %e, "Could not check notebook server status"),
                }
            }
            _ = tokio::time::sleep(config.startup_delay()) => {}
        }

        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Asks the server to exit, killing it if it is still up after `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            info!(%status, "Notebook server already exited");
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) {
            // SAFETY: kill(2) with a pid we spawned and still own.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Notebook server stopped"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for notebook server"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis(), "Notebook server did not exit, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill notebook server");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(command: &str, delay_ms: u64) -> ServerConfig {
        ServerConfig {
            launch: true,
            command: command.to_string(),
            startup_delay_ms: delay_ms,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let err = NotebookServer::launch(&config("/nonexistent/jupyter", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/jupyter"));
    }

    #[tokio::test]
    async fn test_program_exiting_during_startup() {
        // `true` ignores its arguments and exits at once.
        let err = NotebookServer::launch(&config("true", 5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::ExitedEarly { .. }));
    }
}
