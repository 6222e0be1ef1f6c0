//! Transport abstraction traits for hubbridge.
//!
//! Transports invoke listeners synchronously on whatever thread or task
//! they run on. Listeners must hand work off quickly and never block.

use crate::listeners::ListenerToken;
use hubbridge_protocol::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Network mechanism used to carry a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Let the transport pick, preferring WebSockets.
    #[default]
    Auto,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    /// Map the host's numeric selector. Unknown codes select [`TransportKind::Auto`].
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => TransportKind::ServerSentEvents,
            2 => TransportKind::LongPolling,
            _ => TransportKind::Auto,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Auto => "auto",
            TransportKind::ServerSentEvents => "serverSentEvents",
            TransportKind::LongPolling => "longPolling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport errors.
///
/// Errors are cloned to every lifecycle listener, so payloads are strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation or the server went silent for too long.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server refused the handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Malformed hub message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport cannot serve the request at all.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The server reported an error.
    #[error("{0}")]
    Remote(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error reports a timeout, locally detected or server side.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout(_) => true,
            TransportError::Remote(message) => message.contains("TimeoutException"),
            _ => false,
        }
    }

    /// Whether retrying the same connection cannot succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Handshake(_) | TransportError::Unsupported(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Endpoint and request options for a new connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectOptions {
    /// Base URL of the server.
    pub url: String,
    /// Hub the connection is opened for.
    pub hub_name: String,
    /// Raw query string, appended only when present.
    pub query_string: Option<String>,
    /// Extra request headers, applied only when present.
    pub headers: Option<BTreeMap<String, String>>,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(url: impl Into<String>, hub_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hub_name: hub_name.into(),
            query_string: None,
            headers: None,
        }
    }

    /// Set the query string. An empty string leaves it unset.
    #[must_use]
    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query_string = (!query.is_empty()).then_some(query);
        self
    }

    /// Set the headers. An empty map leaves them unset.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = (!headers.is_empty()).then_some(headers);
        self
    }
}

/// A connection state change reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    Connected,
    Reconnecting,
    Reconnected,
    /// The link is alive but the server has been quiet longer than expected.
    Slow,
    Closed,
    Error(TransportError),
}

/// Receives lifecycle signals of one connection.
pub type LifecycleListener = Arc<dyn Fn(LifecycleSignal) + Send + Sync>;

/// Receives the arguments of a server push for one hub method.
pub type MethodListener = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Receives the outcome of an invocation.
///
/// It is an `Fn` rather than an `FnOnce`: callers must tolerate a transport
/// that reports more than one outcome for the same call.
pub type CompletionCallback = Arc<dyn Fn(Result<Value, TransportError>) + Send + Sync>;

/// Builds connections. One connector serves every connection of a registry.
pub trait Connector: Send + Sync {
    /// Create a connection object. No network I/O happens until `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options cannot describe a valid endpoint.
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn HubConnection>, TransportError>;

    /// Transport kinds this connector can honour. `Auto` is always implied.
    fn supported_kinds(&self) -> &'static [TransportKind] {
        &[TransportKind::Auto]
    }
}

/// One logical real-time session.
pub trait HubConnection: Send + Sync {
    /// Get (or create) the RPC proxy for a hub.
    fn create_hub_proxy(&self, hub_name: &str) -> Arc<dyn HubProxy>;

    /// Register a lifecycle listener.
    fn on_lifecycle(&self, listener: LifecycleListener) -> ListenerToken;

    /// Remove a lifecycle listener. Unknown tokens are ignored.
    fn off_lifecycle(&self, token: ListenerToken);

    /// Issue a start (or restart) over the given transport kind.
    ///
    /// Returns once the start is under way; completion arrives as a
    /// [`LifecycleSignal`].
    ///
    /// # Errors
    ///
    /// Returns an error if the start cannot even be issued.
    fn start(&self, kind: TransportKind) -> Result<(), TransportError>;

    /// Stop the session. Pending invocations fail with `ConnectionClosed`.
    fn stop(&self);
}

/// Client-side handle of a server hub.
pub trait HubProxy: Send + Sync {
    /// Name of the hub this proxy addresses.
    fn hub_name(&self) -> &str;

    /// Subscribe to pushes of `method`.
    fn on(&self, method: &str, listener: MethodListener) -> ListenerToken;

    /// Remove a method subscription. Unknown tokens are ignored.
    fn off(&self, token: ListenerToken);

    /// Invoke a server method. The outcome is reported through `completion`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be issued (e.g. not connected).
    fn invoke(
        &self,
        method: &str,
        arguments: Vec<Value>,
        completion: CompletionCallback,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_codes() {
        assert_eq!(TransportKind::from_code(0), TransportKind::Auto);
        assert_eq!(TransportKind::from_code(1), TransportKind::ServerSentEvents);
        assert_eq!(TransportKind::from_code(2), TransportKind::LongPolling);
        assert_eq!(TransportKind::from_code(7), TransportKind::Auto);
        assert_eq!(TransportKind::from_code(-1), TransportKind::Auto);
    }

    #[test]
    fn test_timeout_detection() {
        assert!(TransportError::Timeout("server silent".into()).is_timeout());
        assert!(
            TransportError::Remote("System.TimeoutException: took too long".into()).is_timeout()
        );
        assert!(!TransportError::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_empty_options_stay_unset() {
        let options = ConnectOptions::new("http://localhost", "Chat")
            .with_query_string("")
            .with_headers(BTreeMap::new());
        assert!(options.query_string.is_none());
        assert!(options.headers.is_none());

        let options = options.with_query_string("token=abc");
        assert_eq!(options.query_string.as_deref(), Some("token=abc"));
    }
}
