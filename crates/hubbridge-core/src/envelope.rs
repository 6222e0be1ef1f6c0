//! Items flowing from the bridge to the host.

use crate::error::BridgeError;
use crate::handle::LifecycleState;
use hubbridge_protocol::{Frame, Value};

/// Data reported for a server push that carried no arguments.
pub const NO_DATA: &str = "null or empty";

/// An asynchronous notification about one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// The connection changed state.
    ConnectionStatus {
        connection_id: String,
        state: LifecycleState,
        /// Error text, set for [`LifecycleState::Errored`].
        detail: Option<String>,
    },
    /// The server pushed a subscribed hub method.
    NewMessage {
        connection_id: String,
        method: String,
        data: Value,
    },
}

impl Envelope {
    #[must_use]
    pub fn status(
        connection_id: impl Into<String>,
        state: LifecycleState,
        detail: Option<String>,
    ) -> Self {
        Envelope::ConnectionStatus {
            connection_id: connection_id.into(),
            state,
            detail,
        }
    }

    /// Build a push envelope. Only the first argument is forwarded.
    #[must_use]
    pub fn new_message(
        connection_id: impl Into<String>,
        method: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        let data = arguments
            .into_iter()
            .next()
            .unwrap_or_else(|| Value::from(NO_DATA));
        Envelope::NewMessage {
            connection_id: connection_id.into(),
            method: method.into(),
            data,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        match self {
            Envelope::ConnectionStatus { connection_id, .. }
            | Envelope::NewMessage { connection_id, .. } => connection_id,
        }
    }

    /// Status label as the host sees it, `None` for pushes.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        match self {
            Envelope::ConnectionStatus { state, detail, .. } => {
                Some(state.label(detail.as_deref()))
            }
            Envelope::NewMessage { .. } => None,
        }
    }

    #[must_use]
    pub fn into_frame(self) -> Frame {
        match self {
            Envelope::ConnectionStatus {
                connection_id,
                state,
                detail,
            } => Frame::status(connection_id, state.label(detail.as_deref())),
            Envelope::NewMessage {
                connection_id,
                method,
                data,
            } => Frame::new_message(connection_id, &method, data),
        }
    }
}

/// The outcome of one host request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub seq: u64,
    pub outcome: Result<Value, BridgeError>,
}

impl Reply {
    #[must_use]
    pub fn new(seq: u64, outcome: Result<Value, BridgeError>) -> Self {
        Self { seq, outcome }
    }

    #[must_use]
    pub fn into_frame(self) -> Frame {
        match self.outcome {
            Ok(value) => Frame::ok(self.seq, value),
            Err(err) => Frame::error(self.seq, err.code(), err.to_string()),
        }
    }
}

/// One item on the outbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Envelope),
    Reply(Reply),
}

impl Outbound {
    #[must_use]
    pub fn into_frame(self) -> Frame {
        match self {
            Outbound::Event(envelope) => envelope.into_frame(),
            Outbound::Reply(reply) => reply.into_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubbridge_protocol::{ErrorCode, EventKind, Outcome};

    #[test]
    fn test_new_message_takes_first_argument() {
        let envelope = Envelope::new_message(
            "c1",
            "ReceiveMessage",
            vec![Value::from("hi"), Value::from("ignored")],
        );
        assert_eq!(
            envelope,
            Envelope::NewMessage {
                connection_id: "c1".into(),
                method: "ReceiveMessage".into(),
                data: Value::from("hi"),
            }
        );
    }

    #[test]
    fn test_new_message_without_arguments() {
        let envelope = Envelope::new_message("c1", "Ping", vec![]);
        match envelope {
            Envelope::NewMessage { data, .. } => assert_eq!(data, Value::from(NO_DATA)),
            other => panic!("Expected push, got {:?}", other),
        }
    }

    #[test]
    fn test_error_status_frame() {
        let frame = Envelope::status("c1", LifecycleState::Errored, Some("boom".into())).into_frame();
        assert_eq!(
            frame,
            Frame::Event {
                connection_id: "c1".into(),
                kind: EventKind::ConnectionStatus,
                payload: Value::from("Error: boom"),
            }
        );
    }

    #[test]
    fn test_failed_reply_frame() {
        let reply = Reply::new(9, Err(BridgeError::NotFound("c2".into())));
        match reply.into_frame() {
            Frame::Reply { seq, outcome } => {
                assert_eq!(seq, 9);
                assert_eq!(
                    outcome,
                    Outcome::Error {
                        code: ErrorCode::NotFound,
                        message: "Connection not found: c2".into(),
                    }
                );
            }
            other => panic!("Expected reply, got {:?}", other),
        }
    }
}
