//! Message classifier: raw kernel messages → record payloads.
//!
//! Classification is pure and total. Every message yields exactly one
//! [`RecordKind`]; missing or mistyped fields fall back to defaults and
//! unknown message types are kept as [`RecordKind::Unclassified`].
//!
//! Each channel carries its own vocabulary, so the channel decides which
//! entry point applies:
//!
//! | channel   | message type     | record            |
//! |-----------|------------------|-------------------|
//! | broadcast | `execute_input`  | `CellInput`       |
//! | broadcast | `stream`         | `StreamOutput`    |
//! | broadcast | `execute_result` | `ExecutionResult` |
//! | broadcast | `display_data`   | `DisplayData`     |
//! | broadcast | `error`          | `ErrorResult`     |
//! | control   | `execute_reply`  | `ExecutionStatus` |
//! | input     | *any*            | `InputRequest`    |
//! | *         | *other*          | `Unclassified`    |

use tracing::trace;

use crate::{ChannelKind, RawMessage, RecordKind, ReplyStatus};

/// Classifies a message according to the channel it arrived on.
pub fn classify(msg: &RawMessage, channel: ChannelKind) -> RecordKind {
    match channel {
        ChannelKind::Broadcast => classify_broadcast(msg),
        ChannelKind::Control => classify_control(msg),
        ChannelKind::Input => classify_input(msg),
    }
}

/// Classifies an iopub (broadcast) message.
pub fn classify_broadcast(msg: &RawMessage) -> RecordKind {
    match msg.msg_type.as_str() {
        "execute_input" => RecordKind::CellInput {
            execution_count: msg.u64_field("execution_count"),
            code: msg.str_field("code").unwrap_or_default().to_string(),
        },
        "stream" => RecordKind::StreamOutput {
            stream: msg.str_field("name").map(str::to_string),
            text: msg.str_field("text").unwrap_or_default().to_string(),
        },
        "execute_result" => RecordKind::ExecutionResult {
            execution_count: msg.u64_field("execution_count"),
            data: msg.map_field("data"),
        },
        "display_data" => RecordKind::DisplayData {
            data: msg.map_field("data"),
        },
        "error" => RecordKind::ErrorResult {
            ename: msg.str_field("ename").map(str::to_string),
            evalue: msg.str_field("evalue").map(str::to_string),
            traceback: msg.string_list_field("traceback"),
        },
        _ => unclassified(msg),
    }
}

/// Classifies a shell (control) message.
pub fn classify_control(msg: &RawMessage) -> RecordKind {
    match msg.msg_type.as_str() {
        "execute_reply" => RecordKind::ExecutionStatus {
            status: ReplyStatus::parse(msg.str_field("status")),
            execution_count: msg.u64_field("execution_count"),
        },
        _ => unclassified(msg),
    }
}

/// Classifies a stdin message.
///
/// Only the request envelope is read: the prompt and whether the input
/// is hidden. Whatever the user types travels in a reply this monitor
/// never opens.
pub fn classify_input(msg: &RawMessage) -> RecordKind {
    RecordKind::InputRequest {
        prompt: msg.str_field("prompt").unwrap_or_default().to_string(),
        sensitive: msg.bool_field("password").unwrap_or(false),
    }
}

fn unclassified(msg: &RawMessage) -> RecordKind {
    trace!(msg_type = %msg.msg_type, "Keeping unrecognised message verbatim");
    RecordKind::Unclassified {
        msg_type: msg.msg_type.clone(),
        content: msg.content.clone(),
    }
}
