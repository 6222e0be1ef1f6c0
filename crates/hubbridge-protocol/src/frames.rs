//! Frame types exchanged with the host.
//!
//! Frames are serialized with MessagePack using named fields, so the host can
//! decode them with any MessagePack library into plain maps.

use crate::command::Command;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Error codes carried by failed replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    DuplicateConnection = 1,
    NotFound = 2,
    InvalidArgument = 3,
    InvocationFailed = 4,
    Transport = 5,
    NotImplemented = 6,
    LimitReached = 7,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::DuplicateConnection),
            2 => Ok(ErrorCode::NotFound),
            3 => Ok(ErrorCode::InvalidArgument),
            4 => Ok(ErrorCode::InvocationFailed),
            5 => Ok(ErrorCode::Transport),
            6 => Ok(ErrorCode::NotImplemented),
            7 => Ok(ErrorCode::LimitReached),
            _ => Err("Invalid error code"),
        }
    }
}

/// Kind of an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A connection lifecycle label such as `"Connected"` or `"Error: ..."`.
    ConnectionStatus,
    /// A server push: payload is `[methodName, data]`.
    NewMessage,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConnectionStatus => "ConnectionStatus",
            EventKind::NewMessage => "NewMessage",
        }
    }
}

/// The single outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Outcome {
    #[serde(rename = "ok")]
    Ok { value: Value },

    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl Outcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }
}

/// A host channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A command from the host.
    #[serde(rename = "request")]
    Request {
        /// Sequence number echoed in the reply.
        seq: u64,
        /// Command method name.
        method: String,
        /// Command arguments, normally a map.
        #[serde(default)]
        arguments: Value,
    },

    /// The outcome of a request.
    #[serde(rename = "reply")]
    Reply { seq: u64, outcome: Outcome },

    /// An asynchronous event for one connection.
    #[serde(rename = "event")]
    Event {
        connection_id: String,
        kind: EventKind,
        payload: Value,
    },
}

impl Frame {
    /// Short name of the frame variant, for logs and metric labels.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Reply { .. } => "reply",
            Frame::Event { .. } => "event",
        }
    }

    /// Create a request frame for a command.
    #[must_use]
    pub fn request(seq: u64, command: &Command) -> Self {
        Frame::Request {
            seq,
            method: command.method().to_string(),
            arguments: command.arguments(),
        }
    }

    /// Create a successful reply.
    #[must_use]
    pub fn ok(seq: u64, value: impl Into<Value>) -> Self {
        Frame::Reply {
            seq,
            outcome: Outcome::Ok {
                value: value.into(),
            },
        }
    }

    /// Create a failed reply.
    #[must_use]
    pub fn error(seq: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Reply {
            seq,
            outcome: Outcome::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Create a connection status event.
    #[must_use]
    pub fn status(connection_id: impl Into<String>, label: impl Into<String>) -> Self {
        Frame::Event {
            connection_id: connection_id.into(),
            kind: EventKind::ConnectionStatus,
            payload: Value::String(label.into()),
        }
    }

    /// Create a pushed-message event with payload `[method, data]`.
    #[must_use]
    pub fn new_message(connection_id: impl Into<String>, method: &str, data: Value) -> Self {
        Frame::Event {
            connection_id: connection_id.into(),
            kind: EventKind::NewMessage,
            payload: Value::List(vec![Value::from(method), data]),
        }
    }
}
