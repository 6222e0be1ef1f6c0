//! In-memory loopback transport.
//!
//! Nothing leaves the process: the owner drives each connection by hand,
//! emitting lifecycle signals and server pushes and scripting the outcome of
//! invocations. Every call the bridge makes is recorded for inspection.

use crate::listeners::{ListenerList, ListenerTable, ListenerToken};
use crate::traits::{
    CompletionCallback, ConnectOptions, Connector, HubConnection, HubProxy, LifecycleListener,
    LifecycleSignal, MethodListener, TransportError, TransportKind,
};
use hubbridge_protocol::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Produces the outcomes reported for an invocation, in order.
///
/// Returning more than one outcome simulates a transport that completes a
/// call twice; returning none simulates a call that never completes.
pub type Responder = Arc<dyn Fn(&str, &[Value]) -> Vec<Result<Value, TransportError>> + Send + Sync>;

const KINDS: &[TransportKind] = &[
    TransportKind::Auto,
    TransportKind::ServerSentEvents,
    TransportKind::LongPolling,
];

#[derive(Default)]
struct ConnectorState {
    connections: Mutex<Vec<LoopbackConnection>>,
    responder: Mutex<Option<Responder>>,
    refuse_next: Mutex<Option<TransportError>>,
    fail_first_start: Mutex<Option<TransportError>>,
}

/// Connector handing out loopback connections.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<ConnectorState>,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Responder installed on every connection created from now on.
    pub fn set_responder(&self, responder: Responder) {
        *self.state.responder.lock() = Some(responder);
    }

    /// Make the next `connect` call fail with `error`.
    pub fn refuse_next(&self, error: TransportError) {
        *self.state.refuse_next.lock() = Some(error);
    }

    /// Make the first `start` of the next connection created fail with
    /// `error`.
    pub fn fail_next_start(&self, error: TransportError) {
        *self.state.fail_first_start.lock() = Some(error);
    }

    /// All connections created so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<LoopbackConnection> {
        self.state.connections.lock().clone()
    }

    /// The most recently created connection.
    #[must_use]
    pub fn last(&self) -> Option<LoopbackConnection> {
        self.state.connections.lock().last().cloned()
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn HubConnection>, TransportError> {
        if let Some(error) = self.state.refuse_next.lock().take() {
            return Err(error);
        }

        let connection = LoopbackConnection::new(options.clone());
        if let Some(responder) = self.state.responder.lock().clone() {
            connection.set_responder(responder);
        }
        if let Some(error) = self.state.fail_first_start.lock().take() {
            connection.fail_next_start(error);
        }
        self.state.connections.lock().push(connection.clone());
        Ok(Arc::new(connection))
    }

    fn supported_kinds(&self) -> &'static [TransportKind] {
        KINDS
    }
}

struct LoopbackInner {
    options: ConnectOptions,
    lifecycle: ListenerList<LifecycleListener>,
    methods: ListenerTable<MethodListener>,
    responder: Mutex<Option<Responder>>,
    starts: Mutex<Vec<TransportKind>>,
    fail_next_start: Mutex<Option<TransportError>>,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    hubs: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

/// A hand-driven connection. Clones share the same state.
#[derive(Clone)]
pub struct LoopbackConnection {
    inner: Arc<LoopbackInner>,
}

impl LoopbackConnection {
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                options,
                lifecycle: ListenerList::new(),
                methods: ListenerTable::new(),
                responder: Mutex::new(None),
                starts: Mutex::new(Vec::new()),
                fail_next_start: Mutex::new(None),
                invocations: Mutex::new(Vec::new()),
                hubs: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Options the connection was created with.
    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.inner.responder.lock() = Some(responder);
    }

    /// Make the next `start` call fail synchronously with `error`.
    pub fn fail_next_start(&self, error: TransportError) {
        *self.inner.fail_next_start.lock() = Some(error);
    }

    /// Report a lifecycle signal to every lifecycle listener.
    pub fn emit(&self, signal: LifecycleSignal) {
        trace!(?signal, "Loopback lifecycle signal");
        for listener in self.inner.lifecycle.snapshot() {
            listener(signal.clone());
        }
    }

    /// Simulate a server push. Returns the number of listeners reached.
    ///
    /// Pushes are delivered even after `stop`, to exercise late-event races.
    pub fn push(&self, method: &str, arguments: Vec<Value>) -> usize {
        let listeners = self.inner.methods.snapshot(method);
        for listener in &listeners {
            listener(arguments.clone());
        }
        listeners.len()
    }

    /// Transport kinds passed to each `start`, in order.
    #[must_use]
    pub fn starts(&self) -> Vec<TransportKind> {
        self.inner.starts.lock().clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Invocations issued so far as `(method, arguments)`.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.invocations.lock().clone()
    }

    /// Hub names proxies were created for.
    #[must_use]
    pub fn hubs(&self) -> Vec<String> {
        self.inner.hubs.lock().clone()
    }

    /// Number of listeners subscribed to `method`.
    #[must_use]
    pub fn listener_count(&self, method: &str) -> usize {
        self.inner.methods.count(method)
    }

    /// Number of lifecycle listeners.
    #[must_use]
    pub fn lifecycle_listener_count(&self) -> usize {
        self.inner.lifecycle.len()
    }
}

impl HubConnection for LoopbackConnection {
    fn create_hub_proxy(&self, hub_name: &str) -> Arc<dyn HubProxy> {
        self.inner.hubs.lock().push(hub_name.to_string());
        Arc::new(LoopbackProxy {
            hub_name: hub_name.to_string(),
            connection: self.clone(),
        })
    }

    fn on_lifecycle(&self, listener: LifecycleListener) -> ListenerToken {
        self.inner.lifecycle.add(listener)
    }

    fn off_lifecycle(&self, token: ListenerToken) {
        self.inner.lifecycle.remove(token);
    }

    fn start(&self, kind: TransportKind) -> Result<(), TransportError> {
        if let Some(error) = self.inner.fail_next_start.lock().take() {
            return Err(error);
        }
        self.inner.starts.lock().push(kind);
        self.inner.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

struct LoopbackProxy {
    hub_name: String,
    connection: LoopbackConnection,
}

impl HubProxy for LoopbackProxy {
    fn hub_name(&self) -> &str {
        &self.hub_name
    }

    fn on(&self, method: &str, listener: MethodListener) -> ListenerToken {
        self.connection.inner.methods.add(method, listener)
    }

    fn off(&self, token: ListenerToken) {
        self.connection.inner.methods.remove(token);
    }

    fn invoke(
        &self,
        method: &str,
        arguments: Vec<Value>,
        completion: CompletionCallback,
    ) -> Result<(), TransportError> {
        let inner = &self.connection.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        inner
            .invocations
            .lock()
            .push((method.to_string(), arguments.clone()));

        let responder = inner.responder.lock().clone();
        let outcomes = match responder {
            Some(responder) => responder(method, &arguments),
            None => vec![Ok(Value::Null)],
        };
        for outcome in outcomes {
            completion(outcome);
        }
        Ok(())
    }
}
