//! Normalized, persisted log records.
//!
//! A [`LogRecord`] is the unit written to the execution log: one JSON
//! object per line, with the record kind flattened into the top level.
//!
//! ```text
//! {"timestamp":"2026-10-14T09:12:03.120Z","monotonic_us":5012,
//!  "session_id":"8e11bfb5","channel":"broadcast",
//!  "kind":"stream_output","stream":"stdout","text":"Hello\n"}
//! ```

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ChannelKind, SessionId};

/// Maximum characters of payload text kept in a one-line summary.
const SUMMARY_MAX_CHARS: usize = 120;

/// Outcome reported by an `execute_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
    /// Status missing or not one of the documented values.
    #[default]
    Unknown,
}

impl ReplyStatus {
    /// Parses a reply status, mapping absent or unrecognized values to `Unknown`.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("ok") => Self::Ok,
            Some("error") => Self::Error,
            Some("aborted") => Self::Aborted,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown",
        }
    }
}

/// Kind-specific payload of a log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    /// Source code sent for execution (`execute_input`).
    CellInput {
        execution_count: Option<u64>,
        code: String,
    },
    /// A chunk of stdout/stderr (`stream`).
    StreamOutput { stream: Option<String>, text: String },
    /// The value of the last expression (`execute_result`).
    ExecutionResult {
        execution_count: Option<u64>,
        data: Map<String, Value>,
    },
    /// Rich output such as images or HTML (`display_data`).
    DisplayData { data: Map<String, Value> },
    /// An exception raised by the cell (`error`).
    ErrorResult {
        ename: Option<String>,
        evalue: Option<String>,
        traceback: Vec<String>,
    },
    /// The kernel asked the frontend for input. The reply is never recorded.
    InputRequest { prompt: String, sensitive: bool },
    /// Completion of an execution (`execute_reply`).
    ExecutionStatus {
        status: ReplyStatus,
        execution_count: Option<u64>,
    },
    /// Anything else, preserved verbatim.
    Unclassified { msg_type: String, content: Value },
}

impl RecordKind {
    /// Returns the serialized kind tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CellInput { .. } => "cell_input",
            Self::StreamOutput { .. } => "stream_output",
            Self::ExecutionResult { .. } => "execution_result",
            Self::DisplayData { .. } => "display_data",
            Self::ErrorResult { .. } => "error_result",
            Self::InputRequest { .. } => "input_request",
            Self::ExecutionStatus { .. } => "execution_status",
            Self::Unclassified { .. } => "unclassified",
        }
    }

    /// Returns true for records that mark the start of a cell execution.
    #[must_use]
    pub fn is_cell_input(&self) -> bool {
        matches!(self, Self::CellInput { .. })
    }
}

/// Wall-clock plus monotonic timestamp source for records.
///
/// The monotonic part is measured from the clock's origin, so records
/// from one process can be ordered even if the wall clock steps.
#[derive(Debug, Clone, Copy)]
pub struct RecordClock {
    origin: Instant,
}

impl RecordClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Returns (wall clock now, microseconds since origin).
    pub fn now(&self) -> (DateTime<Utc>, u64) {
        let micros = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        (Utc::now(), micros)
    }
}

impl Default for RecordClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One normalized unit of observed kernel activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// Microseconds since the monitoring process started.
    pub monotonic_us: u64,
    pub session_id: SessionId,
    pub channel: ChannelKind,
    #[serde(flatten)]
    pub kind: RecordKind,
}

impl LogRecord {
    /// Stamps a classified payload with the current time.
    pub fn new(
        clock: &RecordClock,
        session_id: SessionId,
        channel: ChannelKind,
        kind: RecordKind,
    ) -> Self {
        let (timestamp, monotonic_us) = clock.now();
        Self {
            timestamp,
            monotonic_us,
            session_id,
            channel,
            kind,
        }
    }

    /// Serializes the record as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses one line of the execution log.
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Returns a short human-readable description for console echo.
    pub fn summary(&self) -> RecordSummary<'_> {
        RecordSummary(self)
    }
}

/// Display adapter produced by [`LogRecord::summary`].
pub struct RecordSummary<'a>(&'a LogRecord);

impl fmt::Display for RecordSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.0;
        write!(f, "[{}] ", record.session_id.short())?;
        match &record.kind {
            RecordKind::CellInput {
                execution_count, ..
            } => match execution_count {
                Some(n) => write!(f, "[IN {n}] Execution started"),
                None => write!(f, "[IN] Execution started"),
            },
            RecordKind::StreamOutput { stream, text } => {
                let name = stream.as_deref().unwrap_or("output").to_uppercase();
                write!(f, "[{name}] {}", truncate(text.trim()))
            }
            RecordKind::ExecutionResult { data, .. } => {
                let plain = data.get("text/plain").and_then(Value::as_str).unwrap_or("");
                write!(f, "[OUTPUT] {}", truncate(plain))
            }
            RecordKind::DisplayData { data } => {
                let mimes: Vec<&str> = data.keys().map(String::as_str).collect();
                write!(f, "[DISPLAY] {}", mimes.join(", "))
            }
            RecordKind::ErrorResult { ename, evalue, .. } => write!(
                f,
                "[ERROR] {}: {}",
                ename.as_deref().unwrap_or("Error"),
                truncate(evalue.as_deref().unwrap_or(""))
            ),
            RecordKind::InputRequest { prompt, sensitive } => {
                let hidden = if *sensitive { " (hidden)" } else { "" };
                write!(f, "[STDIN] Input requested{hidden}: {}", truncate(prompt))
            }
            RecordKind::ExecutionStatus {
                status,
                execution_count,
            } => match execution_count {
                Some(n) => write!(f, "[REPLY {n}] {}", status.as_str()),
                None => write!(f, "[REPLY] {}", status.as_str()),
            },
            RecordKind::Unclassified { msg_type, .. } => write!(f, "[{msg_type}]"),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(SUMMARY_MAX_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: RecordKind) -> LogRecord {
        LogRecord::new(
            &RecordClock::new(),
            SessionId::new("8e11bfb5-7dc2-432b"),
            ChannelKind::Broadcast,
            kind,
        )
    }

    #[test]
    fn test_record_line_layout_is_flat() {
        let rec = record(RecordKind::StreamOutput {
            stream: Some("stdout".to_string()),
            text: "Hello\n".to_string(),
        });
        let value: Value = serde_json::from_str(&rec.to_json_line().unwrap()).unwrap();

        assert_eq!(value["kind"], "stream_output");
        assert_eq!(value["session_id"], "8e11bfb5-7dc2-432b");
        assert_eq!(value["channel"], "broadcast");
        assert_eq!(value["stream"], "stdout");
        assert_eq!(value["text"], "Hello\n");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_record_lines_parse_back_identically() {
        let mut data = Map::new();
        data.insert("text/plain".to_string(), json!("10"));
        data.insert("image/png".to_string(), json!("iVBORw0KGgo="));

        let kinds = vec![
            RecordKind::CellInput {
                execution_count: Some(1),
                code: "print('Hello')\nx=5+5\nx".to_string(),
            },
            RecordKind::ExecutionResult {
                execution_count: None,
                data: data.clone(),
            },
            RecordKind::DisplayData { data },
            RecordKind::ErrorResult {
                ename: Some("NameError".to_string()),
                evalue: None,
                traceback: vec!["line 1".to_string(), "line 2".to_string()],
            },
            RecordKind::InputRequest {
                prompt: "Password: ".to_string(),
                sensitive: true,
            },
            RecordKind::ExecutionStatus {
                status: ReplyStatus::Aborted,
                execution_count: Some(7),
            },
            RecordKind::Unclassified {
                msg_type: "comm_open".to_string(),
                content: json!({"comm_id": "c1", "data": {"nested": [1, 2]}}),
            },
        ];

        for kind in kinds {
            let rec = record(kind);
            let line = rec.to_json_line().unwrap();
            assert!(!line.contains('\n'), "record must fit on one line: {line}");
            let parsed = LogRecord::from_json_line(&line).unwrap();
            assert_eq!(parsed, rec);
        }
    }

    #[test]
    fn test_reply_status_parse() {
        assert_eq!(ReplyStatus::parse(Some("ok")), ReplyStatus::Ok);
        assert_eq!(ReplyStatus::parse(Some("error")), ReplyStatus::Error);
        assert_eq!(ReplyStatus::parse(Some("aborted")), ReplyStatus::Aborted);
        assert_eq!(ReplyStatus::parse(Some("pending")), ReplyStatus::Unknown);
        assert_eq!(ReplyStatus::parse(None), ReplyStatus::Unknown);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = RecordClock::new();
        let (_, first) = clock.now();
        let (_, second) = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn test_summary_lines() {
        let rec = record(RecordKind::ErrorResult {
            ename: Some("ZeroDivisionError".to_string()),
            evalue: Some("division by zero".to_string()),
            traceback: vec![],
        });
        assert_eq!(
            rec.summary().to_string(),
            "[8e11bfb5] [ERROR] ZeroDivisionError: division by zero"
        );

        let rec = record(RecordKind::StreamOutput {
            stream: None,
            text: "  hi \n".to_string(),
        });
        assert_eq!(rec.summary().to_string(), "[8e11bfb5] [OUTPUT] hi");
    }

    #[test]
    fn test_summary_truncates_long_text() {
        let rec = record(RecordKind::InputRequest {
            prompt: "x".repeat(500),
            sensitive: false,
        });
        let summary = rec.summary().to_string();
        assert!(summary.ends_with('…'));
        assert!(summary.chars().count() < 200);
    }
}
