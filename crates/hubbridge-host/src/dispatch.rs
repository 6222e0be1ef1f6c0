//! Command dispatch.
//!
//! Turns host requests into registry calls and posts exactly one reply per
//! request on the outbound sink. Invocations reply later, from a spawned
//! task, once the server answers.

use crate::metrics;
use hubbridge_core::{BridgeError, ConnectionRegistry, OutboundSink};
use hubbridge_protocol::{Command, Frame, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes host frames to the registry.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    sink: OutboundSink,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, sink: OutboundSink) -> Self {
        Self { registry, sink }
    }

    /// Handle one frame from the host.
    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Request {
                seq,
                method,
                arguments,
            } => self.handle_request(seq, &method, &arguments),
            other => {
                warn!(frame_type = other.frame_type(), "Unexpected frame from host");
            }
        }
    }

    /// Handle one request. The reply may be posted after this returns.
    pub fn handle_request(&self, seq: u64, method: &str, arguments: &Value) {
        metrics::record_command(method);

        let command = match Command::parse(method, arguments) {
            Ok(command) => command,
            Err(e) => {
                warn!(seq, method = %method, error = %e, "Rejected request");
                self.sink.reply(seq, Err(BridgeError::from(e)));
                return;
            }
        };

        debug!(seq, method = %method, connection = %command.connection_id(), "Request");

        let outcome = match command {
            Command::ConnectToServer(request) => {
                self.registry.connect(request.into()).map(|()| Value::Bool(true))
            }
            Command::Reconnect { id } => self.registry.reconnect(&id).map(|()| Value::Bool(true)),
            Command::Stop { id } => self.registry.stop(&id).map(|()| Value::Bool(true)),
            Command::IsConnected { id } => Ok(Value::Bool(self.registry.is_connected(&id))),
            Command::ListenToHubMethod { id, method } => self
                .registry
                .listen_to_hub_method(&id, &method)
                .map(|()| Value::Bool(true)),
            Command::InvokeServerMethod {
                id,
                method,
                arguments,
            } => match self.registry.invoke(&id, &method, arguments) {
                Ok(invocation) => {
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        let outcome = invocation.await;
                        if let Err(e) = &outcome {
                            debug!(seq, connection = %id, method = %method, error = %e, "Invocation failed");
                        }
                        sink.reply(seq, outcome);
                    });
                    metrics::set_active_connections(self.registry.len());
                    return;
                }
                Err(e) => Err(e),
            },
        };

        metrics::set_active_connections(self.registry.len());
        self.sink.reply(seq, outcome);
    }

    /// Stop every connection. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let stopped = self.registry.stop_all();
        metrics::set_active_connections(0);
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubbridge_core::{Envelope, LifecycleState, Outbound, OutboundStream, Reply};
    use hubbridge_protocol::ErrorCode;
    use hubbridge_transport::{LifecycleSignal, LoopbackConnector, TransportError};

    fn setup() -> (Dispatcher, LoopbackConnector, OutboundStream) {
        let connector = LoopbackConnector::new();
        let (sink, stream) = OutboundSink::channel();
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(connector.clone()),
            sink.clone(),
        ));
        (Dispatcher::new(registry, sink), connector, stream)
    }

    fn connect_args(id: &str) -> Value {
        Value::map([
            ("Id", Value::from(id)),
            ("baseUrl", Value::from("http://localhost:5000")),
            ("hubName", Value::from("Chat")),
            ("hubMethods", Value::List(vec![Value::from("ReceiveMessage")])),
        ])
    }

    fn next_reply(stream: &mut OutboundStream) -> Reply {
        while let Some(item) = stream.try_recv() {
            if let Outbound::Reply(reply) = item {
                return reply;
            }
        }
        panic!("No reply queued");
    }

    #[test]
    fn test_connect_and_query() {
        let (dispatcher, connector, mut stream) = setup();

        dispatcher.handle_request(1, "connectToServer", &connect_args("c1"));
        assert_eq!(next_reply(&mut stream), Reply::new(1, Ok(Value::Bool(true))));

        connector.last().unwrap().emit(LifecycleSignal::Connected);
        dispatcher.handle_request(2, "isConnected", &Value::map([("Id", Value::from("c1"))]));
        assert_eq!(next_reply(&mut stream), Reply::new(2, Ok(Value::Bool(true))));

        dispatcher.handle_request(3, "connectToServer", &connect_args("c1"));
        let reply = next_reply(&mut stream);
        assert_eq!(
            reply.outcome.unwrap_err().code(),
            ErrorCode::DuplicateConnection
        );
    }

    #[test]
    fn test_invalid_requests() {
        let (dispatcher, _connector, mut stream) = setup();

        dispatcher.handle_request(1, "dance", &Value::Null);
        assert_eq!(
            next_reply(&mut stream).outcome,
            Err(BridgeError::NotImplemented("dance".into()))
        );

        dispatcher.handle_request(2, "stop", &Value::Null);
        assert_eq!(
            next_reply(&mut stream).outcome.unwrap_err().code(),
            ErrorCode::InvalidArgument
        );

        dispatcher.handle_request(3, "stop", &Value::map([("id", Value::from("ghost"))]));
        assert_eq!(
            next_reply(&mut stream).outcome,
            Err(BridgeError::NotFound("ghost".into()))
        );
    }

    #[test]
    fn test_stop_delivers_final_status_then_reply() {
        let (dispatcher, _connector, mut stream) = setup();
        dispatcher.handle_request(1, "connectToServer", &connect_args("c1"));
        next_reply(&mut stream);

        dispatcher.handle_request(2, "stop", &Value::map([("Id", Value::from("c1"))]));
        assert_eq!(
            stream.try_recv(),
            Some(Outbound::Event(Envelope::status(
                "c1",
                LifecycleState::Disconnected,
                None
            )))
        );
        assert_eq!(next_reply(&mut stream), Reply::new(2, Ok(Value::Bool(true))));
    }

    #[tokio::test]
    async fn test_invoke_replies_asynchronously() {
        let (dispatcher, connector, mut stream) = setup();
        connector.set_responder(Arc::new(|method: &str, _args: &[Value]| {
            if method == "Fail" {
                vec![Err(TransportError::Remote("timeout".into()))]
            } else {
                vec![Ok(Value::from("sent"))]
            }
        }));
        dispatcher.handle_request(1, "connectToServer", &connect_args("c1"));
        next_reply(&mut stream);

        dispatcher.handle_request(
            2,
            "invokeServerMethod",
            &Value::map([
                ("Id", Value::from("c1")),
                ("methodName", Value::from("Send")),
                ("arguments", Value::List(vec![Value::from("hello")])),
            ]),
        );
        match stream.recv().await {
            Some(Outbound::Reply(reply)) => {
                assert_eq!(reply, Reply::new(2, Ok(Value::from("sent"))));
            }
            other => panic!("Expected reply, got {:?}", other),
        }

        dispatcher.handle_request(
            3,
            "invokeServerMethod",
            &Value::map([("Id", Value::from("c1")), ("methodName", Value::from("Fail"))]),
        );
        match stream.recv().await {
            Some(Outbound::Reply(Reply { seq, outcome })) => {
                assert_eq!(seq, 3);
                match outcome {
                    Err(BridgeError::InvocationFailed(detail)) => {
                        assert!(detail.contains("timeout"));
                    }
                    other => panic!("Expected InvocationFailed, got {:?}", other),
                }
            }
            other => panic!("Expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_non_request_frames_are_ignored() {
        let (dispatcher, _connector, mut stream) = setup();
        dispatcher.handle_frame(Frame::ok(1, Value::Null));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let (dispatcher, connector, _stream) = setup();
        dispatcher.handle_request(1, "connectToServer", &connect_args("a"));
        dispatcher.handle_request(2, "connectToServer", &connect_args("b"));

        assert_eq!(dispatcher.shutdown(), 2);
        assert!(connector.connections().iter().all(|c| c.is_stopped()));
    }
}
