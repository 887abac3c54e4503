//! Jupyter wire-frame decoding.
//!
//! A kernel message arrives as a ZeroMQ multipart message:
//!
//! ```text
//! [identity ...] <IDS|MSG> signature header parent_header metadata content [buffers ...]
//! ```
//!
//! The signature is the lowercase hex HMAC of the four JSON frames that
//! follow it, keyed with the connection file's `key`.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use nblog_core::RawMessage;

/// Separates routing identities from the message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// The only signature scheme kernels use in practice.
pub const HMAC_SHA256: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

/// Errors decoding a multipart kernel message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("missing <IDS|MSG> delimiter")]
    MissingDelimiter,

    #[error("truncated message: {frames} frames after delimiter (expected at least 5)")]
    Truncated { frames: usize },

    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("invalid JSON in {frame} frame: {reason}")]
    Json { frame: &'static str, reason: String },
}

/// Verifies message signatures for one kernel.
#[derive(Clone)]
pub struct MessageSigner {
    mac: Option<HmacSha256>,
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner")
            .field("enabled", &self.mac.is_some())
            .finish()
    }
}

impl MessageSigner {
    /// Builds a signer from a connection file's key and scheme.
    ///
    /// An empty key disables verification, as Jupyter does.
    pub fn new(key: &str, scheme: &str) -> Result<Self, WireError> {
        if key.is_empty() {
            return Ok(Self::disabled());
        }
        if scheme != HMAC_SHA256 {
            return Err(WireError::UnsupportedScheme(scheme.to_string()));
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|_| WireError::UnsupportedScheme(scheme.to_string()))?;
        Ok(Self { mac: Some(mac) })
    }

    /// A signer that accepts every message.
    pub fn disabled() -> Self {
        Self { mac: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    /// Computes the hex signature of the four signed frames.
    ///
    /// Returns an empty string when signing is disabled.
    pub fn sign(&self, parts: [&[u8]; 4]) -> String {
        let Some(mac) = &self.mac else {
            return String::new();
        };
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        encode_hex(&mac.finalize().into_bytes())
    }

    /// Checks `signature` (hex) against the four signed frames.
    pub fn verify(&self, signature: &[u8], parts: [&[u8]; 4]) -> Result<(), WireError> {
        let Some(mac) = &self.mac else {
            return Ok(());
        };
        let expected = decode_hex(signature).ok_or(WireError::BadSignature)?;
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected)
            .map_err(|_| WireError::BadSignature)
    }
}

/// Decodes a multipart kernel message into a [`RawMessage`].
///
/// A header without `msg_type` decodes to an empty type tag so the
/// classifier can still record it.
pub fn decode_frames<B: AsRef<[u8]>>(
    frames: &[B],
    signer: &MessageSigner,
) -> Result<RawMessage, WireError> {
    let start = frames
        .iter()
        .position(|f| f.as_ref() == DELIMITER)
        .ok_or(WireError::MissingDelimiter)?;

    let body: Vec<&[u8]> = frames
        .iter()
        .skip(start + 1)
        .map(AsRef::as_ref)
        .collect();

    let [signature, header, parent, metadata, content, ..] = body.as_slice() else {
        return Err(WireError::Truncated { frames: body.len() });
    };

    signer.verify(signature, [*header, *parent, *metadata, *content])?;

    let header = parse_json("header", header)?;
    let content = parse_json("content", content)?;
    let msg_type = header
        .get("msg_type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Ok(RawMessage::new(msg_type, content))
}

fn parse_json(frame: &'static str, bytes: &[u8]) -> Result<Value, WireError> {
    serde_json::from_slice(bytes).map_err(|e| WireError::Json {
        frame,
        reason: e.to_string(),
    })
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    raw.chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}
