//! Per-connection state.

use crate::router::Route;
use hubbridge_transport::{
    HubConnection, HubProxy, ListenerToken, TransportError, TransportKind,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle of a connection as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Connecting,
    Connected,
    Reconnecting,
    Slow,
    Disconnected,
    Errored,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Connecting => "Connecting",
            LifecycleState::Connected => "Connected",
            LifecycleState::Reconnecting => "Reconnecting",
            LifecycleState::Slow => "Slow",
            LifecycleState::Disconnected => "Disconnected",
            LifecycleState::Errored => "Error",
        }
    }

    /// Host-facing label; errors read `"Error: <detail>"`.
    #[must_use]
    pub fn label(&self, detail: Option<&str>) -> String {
        match (self, detail) {
            (LifecycleState::Errored, Some(detail)) => format!("Error: {detail}"),
            (state, _) => state.as_str().to_string(),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open connection: the transport session, its hub proxy, the method
/// subscriptions made through it and its delivery route.
///
/// Owned by the registry. Transport listeners only hold `Weak` references.
pub struct ConnectionHandle {
    id: String,
    connection: Arc<dyn HubConnection>,
    proxy: Arc<dyn HubProxy>,
    kind: TransportKind,
    route: Arc<Route>,
    /// Method name to listener token.
    subscriptions: Mutex<HashMap<String, ListenerToken>>,
    lifecycle_token: Mutex<Option<ListenerToken>>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: String,
        connection: Arc<dyn HubConnection>,
        proxy: Arc<dyn HubProxy>,
        kind: TransportKind,
        route: Arc<Route>,
    ) -> Self {
        Self {
            id,
            connection,
            proxy,
            kind,
            route,
            subscriptions: Mutex::new(HashMap::new()),
            lifecycle_token: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport kind the connection is started with.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub fn hub_name(&self) -> &str {
        self.proxy.hub_name()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.route.state()
    }

    /// Subscribed method names, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn connection(&self) -> &Arc<dyn HubConnection> {
        &self.connection
    }

    pub(crate) fn proxy(&self) -> &Arc<dyn HubProxy> {
        &self.proxy
    }

    pub(crate) fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub(crate) fn subscriptions_mut(
        &self,
    ) -> parking_lot::MutexGuard<'_, HashMap<String, ListenerToken>> {
        self.subscriptions.lock()
    }

    pub(crate) fn set_lifecycle_token(&self, token: ListenerToken) {
        *self.lifecycle_token.lock() = Some(token);
    }

    /// Report `Connecting` and issue a new start with the original kind.
    ///
    /// Returns `Ok(false)` without starting if the connection was already
    /// stopped. A refused start is reported as an error status and returned.
    pub(crate) fn restart(&self) -> Result<bool, TransportError> {
        if !self.route.status(LifecycleState::Connecting, None) {
            return Ok(false);
        }

        if let Err(e) = self.connection.start(self.kind) {
            self.route.status(LifecycleState::Errored, Some(e.to_string()));
            return Err(e);
        }

        // A stop racing this call may have stopped the transport before our
        // start went out.
        if !self.route.is_open() {
            self.connection.stop();
            return Ok(false);
        }
        Ok(true)
    }

    /// Close the route, detach every listener and stop the transport.
    ///
    /// Nothing for this connection reaches the sink afterwards.
    pub(crate) fn shutdown(&self) {
        self.route.close();

        let subscriptions: Vec<ListenerToken> =
            self.subscriptions.lock().drain().map(|(_, t)| t).collect();
        for token in subscriptions {
            self.proxy.off(token);
        }
        if let Some(token) = self.lifecycle_token.lock().take() {
            self.connection.off_lifecycle(token);
        }

        self.connection.stop();
        debug!(connection = %self.id, "Connection shut down");
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("hub", &self.proxy.hub_name())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
