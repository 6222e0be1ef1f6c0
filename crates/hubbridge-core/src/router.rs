//! Event routing from transports to the outbound sink.
//!
//! Transports call listeners on their own threads. Each listener owns an
//! `Arc<Route>` for its connection and never touches the registry map on the
//! hot path. The route's gate is read-locked only while an envelope is handed
//! to the sink, so once `stop` has taken the write side and closed it, no
//! further envelope for that connection can be enqueued.

use crate::envelope::Envelope;
use crate::handle::{ConnectionHandle, LifecycleState};
use crate::sink::OutboundSink;
use dashmap::DashMap;
use hubbridge_protocol::Value;
use hubbridge_transport::{HubConnection, HubProxy, LifecycleSignal, TransportError};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Registered connections keyed by id.
pub(crate) type HandleMap = DashMap<String, Arc<ConnectionHandle>>;

/// Delivery path for one connection.
pub(crate) struct Route {
    connection_id: String,
    sink: OutboundSink,
    open: RwLock<bool>,
    state: Mutex<LifecycleState>,
}

impl Route {
    fn new(connection_id: String, sink: OutboundSink) -> Self {
        Self {
            connection_id,
            sink,
            open: RwLock::new(true),
            state: Mutex::new(LifecycleState::Disconnected),
        }
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Hand an envelope to the sink unless the route is closed.
    ///
    /// Status envelopes also record the new state.
    pub(crate) fn deliver(&self, envelope: Envelope) -> bool {
        let open = self.open.read();
        if !*open {
            trace!(connection = %self.connection_id, "Route closed, dropping envelope");
            return false;
        }
        if let Envelope::ConnectionStatus { state, .. } = &envelope {
            *self.state.lock() = *state;
        }
        self.sink.event(envelope)
    }

    pub(crate) fn status(&self, state: LifecycleState, detail: Option<String>) -> bool {
        self.deliver(Envelope::status(self.connection_id.clone(), state, detail))
    }

    /// Close the gate. Waits for in-flight deliveries to finish.
    pub(crate) fn close(&self) {
        self.close_with(None);
    }

    /// Close the gate, enqueueing `last` as the final envelope.
    ///
    /// Both happen under the write lock, so every envelope delivered before
    /// is ahead of `last` in the sink and none can follow it. Returns whether
    /// this call closed the route.
    pub(crate) fn close_with(&self, last: Option<Envelope>) -> bool {
        let mut open = self.open.write();
        if !*open {
            return false;
        }
        if let Some(envelope) = last {
            if let Envelope::ConnectionStatus { state, .. } = &envelope {
                *self.state.lock() = *state;
            }
            self.sink.event(envelope);
        }
        *open = false;
        true
    }
}

/// Map a transport signal onto the host-facing state.
fn map_signal(signal: &LifecycleSignal) -> (LifecycleState, Option<String>) {
    match signal {
        LifecycleSignal::Connected | LifecycleSignal::Reconnected => {
            (LifecycleState::Connected, None)
        }
        LifecycleSignal::Reconnecting => (LifecycleState::Reconnecting, None),
        LifecycleSignal::Slow => (LifecycleState::Slow, None),
        LifecycleSignal::Closed => (LifecycleState::Disconnected, None),
        LifecycleSignal::Error(err) => (LifecycleState::Errored, Some(err.to_string())),
    }
}

/// Attaches listeners to connections and turns what they observe into
/// envelopes.
#[derive(Clone)]
pub struct EventRouter {
    sink: OutboundSink,
    handles: Weak<HandleMap>,
    auto_reconnect_on_timeout: bool,
}

impl EventRouter {
    pub(crate) fn new(
        sink: OutboundSink,
        handles: Weak<HandleMap>,
        auto_reconnect_on_timeout: bool,
    ) -> Self {
        Self {
            sink,
            handles,
            auto_reconnect_on_timeout,
        }
    }

    /// Create the delivery route for a new connection.
    pub(crate) fn route(&self, connection_id: &str) -> Arc<Route> {
        Arc::new(Route::new(connection_id.to_string(), self.sink.clone()))
    }

    /// Subscribe the handle to its connection's lifecycle signals.
    pub(crate) fn attach_lifecycle(&self, handle: &Arc<ConnectionHandle>) {
        let route = handle.route().clone();
        let weak_handle = Arc::downgrade(handle);
        let handles = self.handles.clone();
        let auto_reconnect = self.auto_reconnect_on_timeout;

        let token = handle.connection().on_lifecycle(Arc::new(move |signal: LifecycleSignal| {
            let (state, detail) = map_signal(&signal);
            debug!(connection = %route.connection_id(), state = %state, "Lifecycle signal");

            if !route.status(state, detail) {
                return;
            }
            if let LifecycleSignal::Error(err) = signal {
                on_error(&route, &weak_handle, &handles, auto_reconnect, &err);
            }
        }));
        handle.set_lifecycle_token(token);
    }

    /// Forward pushes of `method` from the handle's hub as `NewMessage`.
    ///
    /// Returns `false` if the method was already subscribed.
    pub fn listen(&self, handle: &ConnectionHandle, method: &str) -> bool {
        let mut subscriptions = handle.subscriptions_mut();
        if subscriptions.contains_key(method) {
            trace!(connection = %handle.id(), method = %method, "Already listening");
            return false;
        }

        let route = handle.route().clone();
        let name = method.to_string();
        let token = handle.proxy().on(
            method,
            Arc::new(move |arguments: Vec<Value>| {
                trace!(connection = %route.connection_id(), method = %name, "Hub push");
                route.deliver(Envelope::new_message(
                    route.connection_id(),
                    name.as_str(),
                    arguments,
                ));
            }),
        );
        subscriptions.insert(method.to_string(), token);

        debug!(connection = %handle.id(), method = %method, "Listening to hub method");
        true
    }

    /// Drop the subscription for `method`. Returns whether one existed.
    pub fn stop_listening(&self, handle: &ConnectionHandle, method: &str) -> bool {
        let token = handle.subscriptions_mut().remove(method);
        match token {
            Some(token) => {
                handle.proxy().off(token);
                debug!(connection = %handle.id(), method = %method, "Stopped listening");
                true
            }
            None => false,
        }
    }
}

fn on_error(
    route: &Route,
    weak_handle: &Weak<ConnectionHandle>,
    handles: &Weak<HandleMap>,
    auto_reconnect: bool,
    err: &TransportError,
) {
    let Some(handle) = weak_handle.upgrade() else {
        return;
    };

    if err.is_fatal() {
        warn!(connection = %route.connection_id(), error = %err, "Unrecoverable transport error");
        if let Some(handles) = handles.upgrade() {
            // A newer connection may already own the id.
            handles.remove_if(route.connection_id(), |_, registered| {
                Arc::ptr_eq(registered, &handle)
            });
        }
        route.close();
        handle.shutdown();
        return;
    }

    if !(auto_reconnect && err.is_timeout()) {
        return;
    }
    info!(connection = %route.connection_id(), "Restarting connection after timeout");
    match handle.restart() {
        Ok(true) => {}
        Ok(false) => debug!(connection = %route.connection_id(), "Stopped before restart"),
        Err(restart) => {
            warn!(connection = %route.connection_id(), error = %restart, "Restart failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Outbound;
    use hubbridge_transport::{
        ConnectOptions, HubConnection, LoopbackConnection, TransportKind,
    };

    fn handle_with(
        router: &EventRouter,
        connection: &LoopbackConnection,
    ) -> Arc<ConnectionHandle> {
        let transport: Arc<dyn HubConnection> = Arc::new(connection.clone());
        let proxy = transport.create_hub_proxy("Chat");
        let handle = Arc::new(ConnectionHandle::new(
            "c1".into(),
            transport,
            proxy,
            TransportKind::Auto,
            router.route("c1"),
        ));
        router.attach_lifecycle(&handle);
        handle
    }

    fn labels(stream: &mut crate::sink::OutboundStream) -> Vec<String> {
        let mut labels = Vec::new();
        while let Some(item) = stream.try_recv() {
            if let Outbound::Event(envelope) = item {
                if let Some(label) = envelope.label() {
                    labels.push(label);
                }
            }
        }
        labels
    }

    #[test]
    fn test_signal_mapping() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), false);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle_with(&router, &connection);

        connection.emit(LifecycleSignal::Connected);
        connection.emit(LifecycleSignal::Slow);
        connection.emit(LifecycleSignal::Reconnecting);
        connection.emit(LifecycleSignal::Reconnected);
        connection.emit(LifecycleSignal::Error(TransportError::Remote("boom".into())));
        connection.emit(LifecycleSignal::Closed);

        assert_eq!(
            labels(&mut stream),
            vec![
                "Connected",
                "Slow",
                "Reconnecting",
                "Connected",
                "Error: boom",
                "Disconnected"
            ]
        );
        assert_eq!(handle.state(), LifecycleState::Disconnected);
    }

    #[test]
    fn test_listen_is_idempotent() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), false);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle_with(&router, &connection);

        assert!(router.listen(&handle, "ReceiveMessage"));
        assert!(!router.listen(&handle, "ReceiveMessage"));
        assert_eq!(connection.listener_count("ReceiveMessage"), 1);

        connection.push("ReceiveMessage", vec![Value::from("hi")]);
        assert!(matches!(stream.try_recv(), Some(Outbound::Event(_))));
        assert!(stream.try_recv().is_none());

        assert!(router.stop_listening(&handle, "ReceiveMessage"));
        assert!(!router.stop_listening(&handle, "ReceiveMessage"));
        assert_eq!(connection.push("ReceiveMessage", vec![]), 0);
    }

    #[test]
    fn test_closed_route_drops_everything() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), false);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle_with(&router, &connection);
        router.listen(&handle, "ReceiveMessage");

        handle.route().close();
        connection.emit(LifecycleSignal::Connected);
        connection.push("ReceiveMessage", vec![Value::from("late")]);

        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_timeout_restart_policy() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), true);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let _handle = handle_with(&router, &connection);

        connection.emit(LifecycleSignal::Error(TransportError::Timeout(
            "server silent".into(),
        )));

        assert_eq!(
            labels(&mut stream),
            vec!["Error: Timed out: server silent", "Connecting"]
        );
        assert_eq!(connection.starts(), vec![TransportKind::Auto]);

        // Non-timeout errors are only reported.
        connection.emit(LifecycleSignal::Error(TransportError::Remote("nope".into())));
        assert_eq!(labels(&mut stream), vec!["Error: nope"]);
        assert_eq!(connection.starts().len(), 1);
    }

    #[test]
    fn test_timeout_without_restart_policy() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), false);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let _handle = handle_with(&router, &connection);

        connection.emit(LifecycleSignal::Error(TransportError::Remote(
            "System.TimeoutException".into(),
        )));

        assert_eq!(labels(&mut stream), vec!["Error: System.TimeoutException"]);
        assert!(connection.starts().is_empty());
    }

    #[test]
    fn test_failed_timeout_restart_reports_error() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), true);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle_with(&router, &connection);

        connection.fail_next_start(TransportError::Io("network unreachable".into()));
        connection.emit(LifecycleSignal::Error(TransportError::Timeout(
            "server silent".into(),
        )));

        assert_eq!(
            labels(&mut stream),
            vec![
                "Error: Timed out: server silent",
                "Connecting",
                "Error: I/O error: network unreachable"
            ]
        );
        assert!(connection.starts().is_empty());
        assert_eq!(handle.state(), LifecycleState::Errored);
    }

    #[test]
    fn test_restart_after_close_does_nothing() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), true);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle_with(&router, &connection);

        handle.route().close();
        assert_eq!(handle.restart(), Ok(false));
        assert!(connection.starts().is_empty());
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_close_with_final_status() {
        let (sink, mut stream) = OutboundSink::channel();
        let router = EventRouter::new(sink, Weak::new(), false);
        let connection = LoopbackConnection::new(ConnectOptions::new("loop://", "Chat"));
        let handle = handle_with(&router, &connection);
        router.listen(&handle, "ReceiveMessage");

        let last = Envelope::status("c1", LifecycleState::Disconnected, None);
        assert!(handle.route().close_with(Some(last.clone())));
        assert!(!handle.route().close_with(Some(last.clone())));
        connection.push("ReceiveMessage", vec![Value::from("late")]);

        assert_eq!(stream.try_recv(), Some(Outbound::Event(last)));
        assert!(stream.try_recv().is_none());
        assert_eq!(handle.state(), LifecycleState::Disconnected);
    }
}
