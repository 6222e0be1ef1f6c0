//! JSON hub protocol messages.
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! `0x1E`. A single WebSocket text frame may carry several records. The
//! session opens with a handshake record in each direction.

use crate::traits::TransportError;
use hubbridge_protocol::Value;
use serde::{Deserialize, Serialize};

/// Record terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol name sent in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

mod message_type {
    pub const INVOCATION: u8 = 1;
    pub const COMPLETION: u8 = 3;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

#[derive(Serialize)]
struct HandshakeRequest {
    protocol: &'static str,
    version: u32,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: &'a str,
    target: &'a str,
    arguments: Vec<serde_json::Value>,
}

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// The server invokes a client method.
    Invocation { target: String, arguments: Vec<Value> },
    /// Outcome of a client invocation.
    Completion {
        invocation_id: String,
        outcome: Result<Value, String>,
    },
    Ping,
    /// The server ends the session.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// A message type the client does not act on (streaming, acks).
    Ignored(u8),
}

/// The handshake record the client sends first.
#[must_use]
pub fn handshake_request() -> String {
    let body = serde_json::to_string(&HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    })
    .unwrap_or_default();
    format!("{body}{RECORD_SEPARATOR}")
}

/// Split a text frame into records, skipping the empty tail.
pub fn records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

/// Check the server's handshake record.
///
/// # Errors
///
/// Returns `Handshake` if the server refused or answered with garbage.
pub fn parse_handshake(record: &str) -> Result<(), TransportError> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| TransportError::Handshake(format!("invalid handshake response: {e}")))?;
    match response.error {
        Some(error) => Err(TransportError::Handshake(error)),
        None => Ok(()),
    }
}

/// Decode one record.
///
/// # Errors
///
/// Returns `Protocol` for malformed JSON or missing required fields.
pub fn parse_message(record: &str) -> Result<HubMessage, TransportError> {
    let raw: RawMessage =
        serde_json::from_str(record).map_err(|e| TransportError::Protocol(e.to_string()))?;

    let message = match raw.kind {
        message_type::INVOCATION => HubMessage::Invocation {
            target: raw
                .target
                .ok_or_else(|| TransportError::Protocol("invocation without target".into()))?,
            arguments: raw.arguments.into_iter().map(Value::from).collect(),
        },
        message_type::COMPLETION => HubMessage::Completion {
            invocation_id: raw.invocation_id.ok_or_else(|| {
                TransportError::Protocol("completion without invocationId".into())
            })?,
            outcome: match raw.error {
                Some(error) => Err(error),
                None => Ok(raw.result.map(Value::from).unwrap_or_default()),
            },
        },
        message_type::PING => HubMessage::Ping,
        message_type::CLOSE => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Ignored(other),
    };

    Ok(message)
}

/// Encode a client invocation record.
///
/// # Errors
///
/// Returns `Protocol` if serialization fails.
pub fn encode_invocation(
    invocation_id: &str,
    target: &str,
    arguments: &[Value],
) -> Result<String, TransportError> {
    let body = serde_json::to_string(&OutgoingInvocation {
        kind: message_type::INVOCATION,
        invocation_id,
        target,
        arguments: arguments.iter().cloned().map(Into::into).collect(),
    })
    .map_err(|e| TransportError::Protocol(e.to_string()))?;
    Ok(format!("{body}{RECORD_SEPARATOR}"))
}

/// Encode a keep-alive ping record.
#[must_use]
pub fn encode_ping() -> String {
    format!("{{\"type\":{}}}{RECORD_SEPARATOR}", message_type::PING)
}
