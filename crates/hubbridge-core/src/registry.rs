//! The connection registry.
//!
//! One registry owns every named connection of a process. It is created once
//! and passed around explicitly; all operations are safe to call from any
//! thread.

use crate::envelope::Envelope;
use crate::error::BridgeError;
use crate::handle::{ConnectionHandle, LifecycleState};
use crate::invocation::{Invocation, InvocationBridge};
use crate::router::{EventRouter, HandleMap};
use crate::sink::OutboundSink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hubbridge_protocol::{ConnectRequest, Value};
use hubbridge_transport::{
    negotiate, ConnectOptions, Connector, HubConnection, TransportKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Restart a connection when the transport reports a timeout error.
    pub auto_reconnect_on_timeout: bool,
    /// Maximum number of open connections.
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auto_reconnect_on_timeout: true,
            max_connections: 64,
        }
    }
}

/// Everything needed to open a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub id: String,
    pub options: ConnectOptions,
    pub kind: TransportKind,
    /// Hub methods to listen to before the connection starts.
    pub hub_methods: Vec<String>,
}

impl ConnectParams {
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>, hub_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options: ConnectOptions::new(url, hub_name),
            kind: TransportKind::Auto,
            hub_methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hub_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hub_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }
}

impl From<ConnectRequest> for ConnectParams {
    fn from(request: ConnectRequest) -> Self {
        Self {
            id: request.id,
            options: ConnectOptions::new(request.base_url, request.hub_name)
                .with_query_string(request.query_string)
                .with_headers(request.headers),
            kind: TransportKind::from_code(request.transport),
            hub_methods: request.hub_methods,
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub connecting: usize,
    pub connected: usize,
    pub reconnecting: usize,
    pub slow: usize,
    pub disconnected: usize,
    pub errored: usize,
}

/// Owner of all open connections.
pub struct ConnectionRegistry {
    handles: Arc<HandleMap>,
    connector: Arc<dyn Connector>,
    router: EventRouter,
    bridge: InvocationBridge,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, sink: OutboundSink) -> Self {
        Self::with_config(connector, sink, RegistryConfig::default())
    }

    #[must_use]
    pub fn with_config(
        connector: Arc<dyn Connector>,
        sink: OutboundSink,
        config: RegistryConfig,
    ) -> Self {
        info!("Creating connection registry with config: {:?}", config);
        let handles = Arc::new(DashMap::new());
        let router = EventRouter::new(
            sink,
            Arc::downgrade(&handles),
            config.auto_reconnect_on_timeout,
        );
        Self {
            handles,
            connector,
            router,
            bridge: InvocationBridge::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Open a connection and issue its start.
    ///
    /// Succeeds once the start is issued; the outcome of the attempt is
    /// reported through status events.
    ///
    /// # Errors
    ///
    /// `DuplicateConnection` if the id is taken, `LimitReached` if too many
    /// connections are open, `Transport` if the connection could not be built
    /// or started.
    pub fn connect(&self, params: ConnectParams) -> Result<(), BridgeError> {
        // Checked before taking the entry: `len` locks every shard.
        if self.handles.len() >= self.config.max_connections {
            return Err(BridgeError::LimitReached(self.config.max_connections));
        }

        let ConnectParams {
            id,
            options,
            kind,
            hub_methods,
        } = params;

        let vacant = match self.handles.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicateConnection(id)),
            Entry::Vacant(vacant) => vacant,
        };

        let connection = self.connector.connect(&options).map_err(|e| {
            warn!(connection = %id, error = %e, "Failed to create connection");
            BridgeError::Transport(e)
        })?;
        let proxy = connection.create_hub_proxy(&options.hub_name);
        let kind = negotiate(kind, self.connector.supported_kinds());

        let handle = Arc::new(ConnectionHandle::new(
            id.clone(),
            connection,
            proxy,
            kind,
            self.router.route(&id),
        ));
        for method in &hub_methods {
            self.router.listen(&handle, method);
        }
        self.router.attach_lifecycle(&handle);

        drop(vacant.insert(handle.clone()));

        handle.route().status(LifecycleState::Connecting, None);
        if let Err(e) = handle.connection().start(kind) {
            warn!(connection = %id, error = %e, "Failed to start connection");
            self.handles
                .remove_if(&id, |_, registered| Arc::ptr_eq(registered, &handle));
            handle.route().close();
            handle.shutdown();
            return Err(BridgeError::Transport(e));
        }

        info!(
            connection = %id,
            url = %options.url,
            hub = %options.hub_name,
            kind = %kind,
            "Connection started"
        );
        Ok(())
    }

    /// Issue a new start on an existing connection.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids or a connection stopped concurrently,
    /// `Transport` if the start was refused. A refused start is also
    /// reported to the host as an error status.
    pub fn reconnect(&self, id: &str) -> Result<(), BridgeError> {
        let handle = self.require(id)?;

        match handle.restart() {
            Ok(true) => {
                info!(connection = %id, "Connection restarted");
                Ok(())
            }
            Ok(false) => Err(BridgeError::NotFound(id.to_string())),
            Err(e) => {
                warn!(connection = %id, error = %e, "Failed to restart connection");
                Err(BridgeError::Transport(e))
            }
        }
    }

    /// Stop a connection and forget it.
    ///
    /// The host receives a final `Disconnected` status; nothing else for this
    /// id is delivered once this returns.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, including a second stop.
    pub fn stop(&self, id: &str) -> Result<(), BridgeError> {
        let (_, handle) = self
            .handles
            .remove(id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;

        handle.route().close_with(Some(Envelope::status(
            id,
            LifecycleState::Disconnected,
            None,
        )));
        handle.shutdown();

        info!(connection = %id, "Connection stopped");
        Ok(())
    }

    /// Stop every connection. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let ids = self.connection_ids();
        ids.iter().filter(|id| self.stop(id).is_ok()).count()
    }

    /// Whether the connection exists and is currently connected.
    #[must_use]
    pub fn is_connected(&self, id: &str) -> bool {
        self.handles
            .get(id)
            .is_some_and(|h| h.state() == LifecycleState::Connected)
    }

    /// Current state of a connection.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<LifecycleState> {
        self.handles.get(id).map(|h| h.state())
    }

    /// Forward server pushes of `method` as `NewMessage` events.
    ///
    /// Listening twice to the same method is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn listen_to_hub_method(&self, id: &str, method: &str) -> Result<(), BridgeError> {
        let handle = self.require(id)?;
        if !self.router.listen(&handle, method) {
            debug!(connection = %id, method = %method, "Duplicate listen ignored");
        }
        Ok(())
    }

    /// Stop forwarding `method`. Returns whether a subscription existed.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn stop_listening(&self, id: &str, method: &str) -> Result<bool, BridgeError> {
        let handle = self.require(id)?;
        Ok(self.router.stop_listening(&handle, method))
    }

    /// Invoke a server method on a connection.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids. Call failures surface through the
    /// returned [`Invocation`].
    pub fn invoke(
        &self,
        id: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<Invocation, BridgeError> {
        let handle = self.require(id)?;
        Ok(self.bridge.invoke(&handle, method, arguments))
    }

    /// Ids of all open connections, sorted.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Connection counts by state.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.handles.iter() {
            stats.total += 1;
            match entry.value().state() {
                LifecycleState::Connecting => stats.connecting += 1,
                LifecycleState::Connected => stats.connected += 1,
                LifecycleState::Reconnecting => stats.reconnecting += 1,
                LifecycleState::Slow => stats.slow += 1,
                LifecycleState::Disconnected => stats.disconnected += 1,
                LifecycleState::Errored => stats.errored += 1,
            }
        }
        stats
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<Arc<ConnectionHandle>> {
        self.handles.get(id).map(|h| h.value().clone())
    }

    fn require(&self, id: &str) -> Result<Arc<ConnectionHandle>, BridgeError> {
        self.lookup(id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let open = self.stop_all();
        if open > 0 {
            debug!(connections = open, "Stopped connections on registry drop");
        }
    }
}
