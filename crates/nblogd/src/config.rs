//! Daemon configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file,
//! then environment variables, then command-line flags (applied by the
//! binary).
//!
//! ```toml
//! log_file = "/var/log/nblog/executions.jsonl"
//! discovery_interval_ms = 2000
//! echo = true
//!
//! [server]
//! launch = true
//! notebook_dir = "~/notebooks"
//! port = 8888
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::poller::PollerConfig;
use crate::session::SessionConfig;
use crate::sink::SinkOptions;

/// Default execution log path (relative to the working directory).
pub const DEFAULT_LOG_FILE: &str = "jupyter_live_execution.log";

/// Environment variable overriding the execution log path.
pub const LOG_FILE_ENV: &str = "NBLOG_LOG_FILE";

/// Environment variable Jupyter uses for its runtime directory.
pub const JUPYTER_RUNTIME_DIR_ENV: &str = "JUPYTER_RUNTIME_DIR";

/// Environment variable Jupyter uses for its data directory.
pub const JUPYTER_DATA_DIR_ENV: &str = "JUPYTER_DATA_DIR";

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Notebook server launch settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Start `jupyter notebook` before monitoring.
    pub launch: bool,
    /// Program to run (normally `jupyter`).
    pub command: String,
    pub notebook_dir: PathBuf,
    pub port: u16,
    /// Time given to the server to come up before discovery starts.
    pub startup_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            launch: false,
            command: "jupyter".to_string(),
            notebook_dir: PathBuf::from("."),
            port: 8888,
            startup_delay_ms: 3000,
        }
    }
}

impl ServerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub log_file: PathBuf,
    /// Directory holding `kernel-*.json` files. `JUPYTER_RUNTIME_DIR`
    /// overrides the file value; otherwise resolved from Jupyter's
    /// data directory when unset.
    pub runtime_dir: Option<PathBuf>,
    pub discovery_interval_ms: u64,
    pub recv_timeout_ms: u64,
    pub idle_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub sink_buffer: usize,
    pub sink_batch: usize,
    /// Also print a one-line summary of every record to the console log.
    pub echo: bool,
    pub server: ServerConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            runtime_dir: None,
            discovery_interval_ms: 2000,
            recv_timeout_ms: 100,
            idle_interval_ms: 10,
            error_backoff_ms: 1000,
            connect_timeout_ms: 5000,
            shutdown_grace_ms: 3000,
            sink_buffer: 1024,
            sink_batch: 64,
            echo: false,
            server: ServerConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Loads configuration from `explicit`, or from the default location
    /// if that file exists, or falls back to defaults.
    ///
    /// An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.is_file()),
        };

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(LOG_FILE_ENV).filter(|v| !v.is_empty()) {
            self.log_file = PathBuf::from(path);
        }
        if let Some(dir) = lookup(JUPYTER_RUNTIME_DIR_ENV).filter(|v| !v.is_empty()) {
            self.runtime_dir = Some(PathBuf::from(dir));
        }
    }

    /// Rejects values that would make a loop spin or never wait.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("recv_timeout_ms", self.recv_timeout_ms),
            ("idle_interval_ms", self.idle_interval_ms),
            ("error_backoff_ms", self.error_backoff_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.sink_buffer == 0 || self.sink_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "sink_buffer",
                reason: "sink buffer and batch must be greater than zero".to_string(),
            });
        }
        if self.log_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "log_file",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the runtime directory to scan, if one can be determined.
    pub fn resolve_runtime_dir(&self) -> Option<PathBuf> {
        self.runtime_dir
            .clone()
            .or_else(|| jupyter_runtime_dir(|key| std::env::var(key).ok()))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            poller: self.poller(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            shutdown_grace: self.shutdown_grace(),
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            interval: Duration::from_millis(self.discovery_interval_ms),
            shutdown_grace: self.shutdown_grace(),
        }
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            buffer: self.sink_buffer,
            batch: self.sink_batch,
            echo: self.echo,
        }
    }
}

/// Returns `$config_dir/nblog/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nblog").join("config.toml"))
}

/// Resolves the Jupyter runtime directory the way Jupyter does.
///
/// `JUPYTER_RUNTIME_DIR` wins, then `JUPYTER_DATA_DIR/runtime`, then the
/// platform data directory.
pub fn jupyter_runtime_dir(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(dir) = lookup(JUPYTER_RUNTIME_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    if let Some(dir) = lookup(JUPYTER_DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join("runtime"));
    }
    platform_data_dir().map(|dir| dir.join("runtime"))
}

#[cfg(target_os = "macos")]
fn platform_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join("Library").join("Jupyter"))
}

#[cfg(not(target_os = "macos"))]
fn platform_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("jupyter"))
}
