//! # hubbridge-transport
//!
//! The boundary between the bridge core and the real-time transport that
//! actually carries hub traffic.
//!
//! The core never speaks a wire protocol itself. It drives connections through
//! three traits:
//!
//! - [`Connector`] - builds a connection for an endpoint
//! - [`HubConnection`] - lifecycle (start, stop, state signals)
//! - [`HubProxy`] - per-hub method subscriptions and invocations
//!
//! Two implementations ship with the crate:
//!
//! - **Loopback** - in-memory, driven by hand; used by tests and demos
//! - **WebSocket** - the JSON hub protocol over `tokio-tungstenite`
//!
//! ```rust,ignore
//! use hubbridge_transport::{Connector, ConnectOptions, TransportKind};
//!
//! let connection = connector.connect(&ConnectOptions::new("http://localhost:5000", "Chat"))?;
//! let proxy = connection.create_hub_proxy("Chat");
//! proxy.on("ReceiveMessage", listener);
//! connection.start(TransportKind::Auto)?;
//! ```

pub mod fallback;
pub mod listeners;
pub mod loopback;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod hub_protocol;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use fallback::negotiate;
pub use listeners::ListenerToken;
pub use loopback::{LoopbackConnection, LoopbackConnector};
pub use traits::{
    CompletionCallback, ConnectOptions, Connector, HubConnection, HubProxy, LifecycleListener,
    LifecycleSignal, MethodListener, TransportError, TransportKind,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
