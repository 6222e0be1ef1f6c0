//! Server method invocation.
//!
//! A transport reports the outcome of a call through a callback that may, if
//! it misbehaves, fire more than once. The bridge turns that into a future
//! that resolves exactly once: the first outcome wins and later ones are
//! discarded.

use crate::error::BridgeError;
use crate::handle::ConnectionHandle;
use hubbridge_protocol::Value;
use hubbridge_transport::{HubProxy, TransportError};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type Outcome = Result<Value, BridgeError>;

/// An issued call waiting for its outcome.
struct PendingInvocation {
    connection_id: String,
    method: String,
    arity: usize,
    slot: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl PendingInvocation {
    /// Resolve the call. Returns `false` if it was already resolved.
    fn complete(&self, outcome: Outcome) -> bool {
        let Some(sender) = self.slot.lock().take() else {
            debug!(
                connection = %self.connection_id,
                method = %self.method,
                "Discarding duplicate invocation outcome"
            );
            return false;
        };
        if sender.send(outcome).is_err() {
            trace!(method = %self.method, "Invocation caller went away");
        }
        true
    }
}

/// Future resolving to the outcome of a server call.
#[derive(Debug)]
#[must_use = "an invocation does nothing observable unless awaited"]
pub struct Invocation {
    method: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl Invocation {
    /// Method being invoked.
    pub fn method(&self) -> &str {
        &self.method
    }

    fn resolved(method: String, outcome: Outcome) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(outcome);
        Self { method, receiver }
    }
}

impl Future for Invocation {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::InvocationFailed(
                "invocation abandoned".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Issues server calls through a connection's hub proxy.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationBridge;

impl InvocationBridge {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Invoke `method` with positional `arguments`.
    ///
    /// The returned future yields the server's result, or `InvocationFailed`
    /// if the call could not be issued, failed remotely, or was dropped by
    /// the transport without an outcome.
    pub fn invoke(
        &self,
        handle: &ConnectionHandle,
        method: &str,
        arguments: Vec<Value>,
    ) -> Invocation {
        let (sender, receiver) = oneshot::channel();
        let pending = Arc::new(PendingInvocation {
            connection_id: handle.id().to_string(),
            method: method.to_string(),
            arity: arguments.len(),
            slot: Mutex::new(Some(sender)),
        });

        debug!(
            connection = %pending.connection_id,
            method = %method,
            arity = pending.arity,
            "Invoking server method"
        );

        let callback = pending.clone();
        let issued = handle.proxy().invoke(
            method,
            arguments,
            Arc::new(move |result: Result<Value, TransportError>| {
                callback.complete(result.map_err(|e| BridgeError::InvocationFailed(e.to_string())));
            }),
        );

        if let Err(err) = issued {
            warn!(
                connection = %pending.connection_id,
                method = %method,
                error = %err,
                "Invocation refused by transport"
            );
            drop(receiver);
            return Invocation::resolved(
                method.to_string(),
                Err(BridgeError::InvocationFailed(err.to_string())),
            );
        }

        Invocation {
            method: method.to_string(),
            receiver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::EventRouter;
    use crate::sink::OutboundSink;
    use hubbridge_transport::{
        ConnectOptions, HubConnection, LoopbackConnection, TransportKind,
    };
    use std::sync::Weak;

    fn handle(connection: &LoopbackConnection) -> ConnectionHandle {
        let (sink, _stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), false);
        let transport: Arc<dyn HubConnection> = Arc::new(connection.clone());
        let proxy = transport.create_hub_proxy("Chat");
        ConnectionHandle::new("c1".into(), transport, proxy, TransportKind::Auto, router.route("c1"))
    }

    #[tokio::test]
    async fn test_result_is_forwarded() {
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        connection.set_responder(Arc::new(|_method: &str, args: &[Value]| {
            vec![Ok(Value::Int(args.len() as i64))]
        }));
        let handle = handle(&connection);

        let result = InvocationBridge::new()
            .invoke(&handle, "Count", vec![Value::Null, Value::Null])
            .await;
        assert_eq!(result, Ok(Value::Int(2)));
        assert_eq!(connection.invocations()[0].0, "Count");
    }

    #[tokio::test]
    async fn test_first_outcome_wins() {
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        connection.set_responder(Arc::new(|_method: &str, _args: &[Value]| {
            vec![
                Ok(Value::from("first")),
                Err(TransportError::Remote("second".into())),
                Ok(Value::from("third")),
            ]
        }));
        let handle = handle(&connection);

        let result = InvocationBridge::new().invoke(&handle, "Send", vec![]).await;
        assert_eq!(result, Ok(Value::from("first")));
    }

    #[tokio::test]
    async fn test_remote_error_becomes_invocation_failed() {
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        connection.set_responder(Arc::new(|_method: &str, _args: &[Value]| {
            vec![Err(TransportError::Remote("timeout".into()))]
        }));
        let handle = handle(&connection);

        match InvocationBridge::new()
            .invoke(&handle, "Send", vec![Value::from("hello")])
            .await
        {
            Err(BridgeError::InvocationFailed(detail)) => assert!(detail.contains("timeout")),
            other => panic!("Expected InvocationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_and_abandoned_calls() {
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle(&connection);

        connection.set_responder(Arc::new(|_method: &str, _args: &[Value]| vec![]));
        let abandoned = InvocationBridge::new().invoke(&handle, "Send", vec![]).await;
        assert_eq!(
            abandoned,
            Err(BridgeError::InvocationFailed("invocation abandoned".into()))
        );

        connection.stop();
        let refused = InvocationBridge::new().invoke(&handle, "Send", vec![]);
        assert_eq!(refused.method(), "Send");
        assert!(matches!(refused.await, Err(BridgeError::InvocationFailed(_))));
    }
}
