//! Raw, unclassified kernel messages.

use serde_json::Value;

/// A message envelope as received from a kernel channel.
///
/// Only the header's `msg_type` and the `content` object are kept;
/// the envelope lives just long enough to be classified.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Declared message type (`execute_input`, `stream`, ...). Empty if absent.
    pub msg_type: String,
    /// Free-form content, normally a JSON object.
    pub content: Value,
}

impl RawMessage {
    pub fn new(msg_type: impl Into<String>, content: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            content,
        }
    }

    /// Returns a string field of the content, if present and a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// Returns an unsigned integer field of the content.
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.content.get(key).and_then(Value::as_u64)
    }

    /// Returns a boolean field of the content.
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.content.get(key).and_then(Value::as_bool)
    }

    /// Returns an object field of the content, cloned, or an empty map.
    pub fn map_field(&self, key: &str) -> serde_json::Map<String, Value> {
        self.content
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a list of strings from the content. Non-string items are kept
    /// as their JSON text.
    pub fn string_list_field(&self, key: &str) -> Vec<String> {
        self.content
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
