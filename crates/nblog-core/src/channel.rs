//! The three kernel channels a session monitor listens on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::DomainError;

/// One of the three disjoint message streams of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Broadcast output (Jupyter `iopub`): inputs, streams, results, errors.
    Broadcast,
    /// Request/reply control (Jupyter `shell`): execution replies.
    Control,
    /// Interactive input requests (Jupyter `stdin`).
    Input,
}

impl ChannelKind {
    /// All channels, in the order a session monitor opens them.
    pub const ALL: [ChannelKind; 3] = [Self::Broadcast, Self::Control, Self::Input];

    /// Returns the lowercase name used in logs and records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Control => "control",
            Self::Input => "input",
        }
    }

    /// Returns the Jupyter name of the underlying socket.
    pub fn jupyter_name(&self) -> &'static str {
        match self {
            Self::Broadcast => "iopub",
            Self::Control => "shell",
            Self::Input => "stdin",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" | "iopub" => Ok(Self::Broadcast),
            "control" | "shell" => Ok(Self::Control),
            "input" | "stdin" => Ok(Self::Input),
            other => Err(DomainError::InvalidChannel {
                value: other.to_string(),
            }),
        }
    }
}
