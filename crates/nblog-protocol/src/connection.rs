//! Kernel connection files.
//!
//! Every running kernel writes `kernel-<id>.json` into the Jupyter runtime
//! directory:
//!
//! ```json
//! {
//!   "shell_port": 53794, "iopub_port": 53795, "stdin_port": 53796,
//!   "control_port": 53797, "hb_port": 53798, "ip": "127.0.0.1",
//!   "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
//!   "transport": "tcp", "signature_scheme": "hmac-sha256",
//!   "kernel_name": "python3"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors reading a connection file.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to read connection file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid connection file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Parsed contents of a kernel connection file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_ip")]
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    #[serde(default)]
    pub control_port: Option<u16>,
    #[serde(default)]
    pub hb_port: Option<u16>,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: Option<String>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".to_string()
}

impl ConnectionInfo {
    /// Reads and parses a connection file.
    pub async fn load(path: &Path) -> Result<Self, ConnectionError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConnectionError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &raw)
    }

    /// Parses connection file contents. `path` is only used for errors.
    pub fn parse(path: &Path, raw: &str) -> Result<Self, ConnectionError> {
        serde_json::from_str(raw).map_err(|source| ConnectionError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the ZeroMQ endpoint for one of the kernel's ports.
    pub fn endpoint(&self, port: u16) -> String {
        if self.transport == "ipc" {
            format!("ipc://{}-{}", self.ip, port)
        } else {
            format!("{}://{}:{}", self.transport, self.ip, port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "shell_port": 53794, "iopub_port": 53795, "stdin_port": 53796,
        "control_port": 53797, "hb_port": 53798, "ip": "127.0.0.1",
        "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
        "transport": "tcp", "signature_scheme": "hmac-sha256",
        "kernel_name": "python3", "jupyter_session": "ignored"
    }"#;

    #[test]
    fn test_parse_full_file() {
        let info = ConnectionInfo::parse(Path::new("kernel-1.json"), SAMPLE).unwrap();
        assert_eq!(info.iopub_port, 53795);
        assert_eq!(info.control_port, Some(53797));
        assert_eq!(info.kernel_name.as_deref(), Some("python3"));
        assert_eq!(info.endpoint(info.shell_port), "tcp://127.0.0.1:53794");
    }

    #[test]
    fn test_parse_minimal_file_uses_defaults() {
        let raw = r#"{"shell_port": 1, "iopub_port": 2, "stdin_port": 3}"#;
        let info = ConnectionInfo::parse(Path::new("k.json"), raw).unwrap();
        assert_eq!(info.transport, "tcp");
        assert_eq!(info.ip, "127.0.0.1");
        assert!(info.key.is_empty());
        assert_eq!(info.signature_scheme, "hmac-sha256");
    }

    #[test]
    fn test_ipc_endpoint() {
        let raw = r#"{"transport": "ipc", "ip": "/tmp/kernel", "shell_port": 1, "iopub_port": 2, "stdin_port": 3}"#;
        let info = ConnectionInfo::parse(Path::new("k.json"), raw).unwrap();
        assert_eq!(info.endpoint(2), "ipc:///tmp/kernel-2");
    }

    #[test]
    fn test_missing_ports_is_an_error() {
        let result = ConnectionInfo::parse(Path::new("k.json"), r#"{"ip": "127.0.0.1"}"#);
        assert!(matches!(result, Err(ConnectionError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel-abc.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let info = ConnectionInfo::load(&path).await.unwrap();
        assert_eq!(info.stdin_port, 53796);

        let missing = ConnectionInfo::load(&dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(ConnectionError::Read { .. })));
    }
}
