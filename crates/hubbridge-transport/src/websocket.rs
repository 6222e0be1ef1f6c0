//! WebSocket transport implementation.
//!
//! Speaks the JSON hub protocol over `tokio-tungstenite`. All network I/O
//! runs in one spawned task per connection; `start` and `stop` only spawn or
//! abort that task. The task owns keep-alive pings, server-timeout and
//! slow-link detection, and a bounded reconnect loop.

use crate::hub_protocol::{self, HubMessage};
use crate::listeners::{ListenerList, ListenerTable, ListenerToken};
use crate::traits::{
    CompletionCallback, ConnectOptions, Connector, HubConnection, HubProxy, LifecycleListener,
    LifecycleSignal, MethodListener, TransportError, TransportKind,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use hubbridge_protocol::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lower bound for the keep-alive period; a zero interval would spin.
const MIN_KEEP_ALIVE: Duration = Duration::from_millis(100);

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Limit for opening the socket and completing the hub handshake.
    pub handshake_timeout: Duration,
    /// Interval between client keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Silence from the server after which the session is considered lost.
    pub server_timeout: Duration,
    /// Reconnect attempts after an established session drops.
    pub reconnect_attempts: u32,
    /// Pause before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Maximum accepted text frame size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            reconnect_attempts: 4,
            reconnect_delay: Duration::from_secs(2),
            max_message_size: 1024 * 1024, // 1 MiB
        }
    }
}

/// Connector for WebSocket hub connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn HubConnection>, TransportError> {
        // Fail early on endpoints that can never work.
        build_request(options)?;

        Ok(Arc::new(WebSocketConnection {
            shared: Arc::new(Shared {
                options: options.clone(),
                config: self.config.clone(),
                lifecycle: ListenerList::new(),
                methods: ListenerTable::new(),
                pending: DashMap::new(),
                next_invocation: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                outbound: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }))
    }
}

/// Turn the base URL, hub name and query string into a socket request.
fn build_request(options: &ConnectOptions) -> Result<Request, TransportError> {
    let base = options.url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(TransportError::Unsupported(format!(
            "URL scheme of {}",
            options.url
        )));
    };

    let mut url = if options.hub_name.is_empty() {
        base
    } else {
        format!("{base}/{}", options.hub_name)
    };
    if let Some(query) = &options.query_string {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(query.trim_start_matches('?'));
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Other(format!("Invalid endpoint {url}: {e}")))?;

    if let Some(headers) = &options.headers {
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Other(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Other(format!("Invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }
    }

    Ok(request)
}

/// State shared between the connection, its proxies and its I/O task.
struct Shared {
    options: ConnectOptions,
    config: WebSocketConfig,
    lifecycle: ListenerList<LifecycleListener>,
    /// Keyed by lower-cased method name; hub method names are case-insensitive.
    methods: ListenerTable<MethodListener>,
    pending: DashMap<String, CompletionCallback>,
    next_invocation: AtomicU64,
    /// Bumped on every start and stop; signals from older tasks are muted.
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit(&self, generation: u64, signal: LifecycleSignal) {
        if !self.is_current(generation) {
            trace!(?signal, "Muted signal from superseded session");
            return;
        }
        for listener in self.lifecycle.snapshot() {
            listener(signal.clone());
        }
    }

    fn attach(&self, generation: u64, sender: mpsc::UnboundedSender<String>) {
        if self.is_current(generation) {
            *self.outbound.lock() = Some(sender);
        }
    }

    fn detach(&self, generation: u64) {
        if self.is_current(generation) {
            *self.outbound.lock() = None;
            self.fail_pending(TransportError::ConnectionClosed);
        }
    }

    fn fail_pending(&self, error: TransportError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, completion)) = self.pending.remove(&id) {
                completion(Err(error.clone()));
            }
        }
    }

    fn dispatch(&self, message: HubMessage) -> Option<SessionEnd> {
        match message {
            HubMessage::Invocation { target, arguments } => {
                let listeners = self.methods.snapshot(&target.to_lowercase());
                if listeners.is_empty() {
                    trace!(method = %target, "No listener for hub method");
                }
                for listener in listeners {
                    listener(arguments.clone());
                }
            }
            HubMessage::Completion {
                invocation_id,
                outcome,
            } => match self.pending.remove(&invocation_id) {
                Some((_, completion)) => completion(outcome.map_err(TransportError::Remote)),
                None => debug!(invocation = %invocation_id, "Completion for unknown invocation"),
            },
            HubMessage::Ping => {}
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                return Some(if allow_reconnect {
                    SessionEnd::Lost(error.map(TransportError::Remote))
                } else {
                    SessionEnd::Closed(error)
                });
            }
            HubMessage::Ignored(kind) => trace!(kind, "Ignoring hub message"),
        }
        None
    }
}

/// How a session ended.
enum SessionEnd {
    /// The session was never established.
    Failed(TransportError),
    /// An established session dropped; worth reconnecting.
    Lost(Option<TransportError>),
    /// The server ended the session for good.
    Closed(Option<String>),
}

/// A WebSocket hub connection.
pub struct WebSocketConnection {
    shared: Arc<Shared>,
}

impl HubConnection for WebSocketConnection {
    fn create_hub_proxy(&self, hub_name: &str) -> Arc<dyn HubProxy> {
        if hub_name != self.shared.options.hub_name {
            warn!(
                requested = %hub_name,
                endpoint = %self.shared.options.hub_name,
                "Hub proxy does not match the endpoint hub"
            );
        }
        Arc::new(WebSocketHubProxy {
            hub_name: hub_name.to_string(),
            shared: self.shared.clone(),
        })
    }

    fn on_lifecycle(&self, listener: LifecycleListener) -> ListenerToken {
        self.shared.lifecycle.add(listener)
    }

    fn off_lifecycle(&self, token: ListenerToken) {
        self.shared.lifecycle.remove(token);
    }

    fn start(&self, kind: TransportKind) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::Other("start requires a Tokio runtime".into()))?;

        if kind != TransportKind::Auto {
            debug!(kind = %kind, "WebSocket transport ignores the requested kind");
        }

        let mut task = self.shared.task.lock();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = task.take() {
            debug!("Restarting hub connection");
            previous.abort();
        }
        *self.shared.outbound.lock() = None;
        self.shared.fail_pending(TransportError::ConnectionClosed);

        *task = Some(runtime.spawn(run(self.shared.clone(), generation)));
        Ok(())
    }

    fn stop(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.shared.task.lock().take();
        if let Some(previous) = previous {
            previous.abort();
        }
        *self.shared.outbound.lock() = None;
        self.shared.fail_pending(TransportError::ConnectionClosed);

        for listener in self.shared.lifecycle.snapshot() {
            listener(LifecycleSignal::Closed);
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
    }
}

/// Proxy for the hub served at the connection's endpoint.
struct WebSocketHubProxy {
    hub_name: String,
    shared: Arc<Shared>,
}

impl HubProxy for WebSocketHubProxy {
    fn hub_name(&self) -> &str {
        &self.hub_name
    }

    fn on(&self, method: &str, listener: MethodListener) -> ListenerToken {
        self.shared.methods.add(&method.to_lowercase(), listener)
    }

    fn off(&self, token: ListenerToken) {
        self.shared.methods.remove(token);
    }

    fn invoke(
        &self,
        method: &str,
        arguments: Vec<Value>,
        completion: CompletionCallback,
    ) -> Result<(), TransportError> {
        let sender = self
            .shared
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;

        let id = self
            .shared
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let record = hub_protocol::encode_invocation(&id, method, &arguments)?;

        // Register before sending so a fast completion finds its callback.
        self.shared.pending.insert(id.clone(), completion);
        if sender.send(record).is_err() {
            self.shared.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }

        trace!(invocation = %id, method = %method, "Invocation sent");
        Ok(())
    }
}

/// Connection task: initial session, then reconnects while allowed.
async fn run(shared: Arc<Shared>, generation: u64) {
    let mut established = false;
    let mut attempts = 0u32;

    loop {
        let end = session(&shared, generation, established).await;
        shared.detach(generation);

        match end {
            SessionEnd::Failed(error) if !established => {
                warn!(error = %error, "Hub connection failed");
                shared.emit(generation, LifecycleSignal::Error(error));
                shared.emit(generation, LifecycleSignal::Closed);
                return;
            }
            SessionEnd::Failed(error) => {
                debug!(error = %error, attempt = attempts, "Reconnect attempt failed");
                if error.is_fatal() {
                    shared.emit(generation, LifecycleSignal::Error(error));
                    shared.emit(generation, LifecycleSignal::Closed);
                    return;
                }
            }
            SessionEnd::Lost(error) => {
                established = true;
                attempts = 0;
                if let Some(error) = error {
                    warn!(error = %error, "Hub connection lost");
                    shared.emit(generation, LifecycleSignal::Error(error));
                }
            }
            SessionEnd::Closed(error) => {
                info!("Hub connection closed by server");
                if let Some(error) = error {
                    shared.emit(generation, LifecycleSignal::Error(TransportError::Remote(error)));
                }
                shared.emit(generation, LifecycleSignal::Closed);
                return;
            }
        }

        if attempts >= shared.config.reconnect_attempts {
            info!(attempts, "Giving up on hub connection");
            shared.emit(generation, LifecycleSignal::Closed);
            return;
        }
        attempts += 1;
        shared.emit(generation, LifecycleSignal::Reconnecting);
        time::sleep(shared.config.reconnect_delay).await;
    }
}

/// Open the socket and perform the hub handshake.
async fn open(shared: &Shared) -> Result<(Socket, Vec<HubMessage>), TransportError> {
    let request = build_request(&shared.options)?;
    let limit = shared.config.handshake_timeout;

    match time::timeout(limit, handshake(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(format!(
            "handshake not completed within {limit:?}"
        ))),
    }
}

async fn handshake(request: Request) -> Result<(Socket, Vec<HubMessage>), TransportError> {
    let (mut socket, _response) = connect_async(request).await.map_err(map_connect_error)?;

    socket
        .send(Message::Text(hub_protocol::handshake_request()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                let mut records = hub_protocol::records(&text);
                let Some(first) = records.next() else {
                    continue;
                };
                hub_protocol::parse_handshake(first)?;
                // Messages batched behind the handshake response.
                let early = records
                    .filter_map(|r| hub_protocol::parse_message(r).ok())
                    .collect();
                return Ok((socket, early));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

fn map_connect_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => {
            TransportError::Handshake(format!("server answered HTTP {}", response.status()))
        }
        WsError::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

/// Run one established session until it ends.
async fn session(shared: &Shared, generation: u64, reconnecting: bool) -> SessionEnd {
    let (mut socket, early) = match open(shared).await {
        Ok(opened) => opened,
        Err(error) => return SessionEnd::Failed(error),
    };

    let (sender, mut outbound) = mpsc::unbounded_channel::<String>();
    shared.attach(generation, sender);
    shared.emit(
        generation,
        if reconnecting {
            LifecycleSignal::Reconnected
        } else {
            LifecycleSignal::Connected
        },
    );
    debug!(url = %shared.options.url, "Hub session established");

    for message in early {
        if let Some(end) = shared.dispatch(message) {
            return end;
        }
    }

    let config = &shared.config;
    let slow_after = config.server_timeout * 2 / 3;
    let mut keep_alive = time::interval(config.keep_alive_interval.max(MIN_KEEP_ALIVE));
    keep_alive.tick().await;
    let mut last_received = Instant::now();
    let mut slow_reported = false;

    loop {
        tokio::select! {
            Some(record) = outbound.recv() => {
                if let Err(e) = socket.send(Message::Text(record)).await {
                    return SessionEnd::Lost(Some(TransportError::SendFailed(e.to_string())));
                }
            }

            _ = keep_alive.tick() => {
                if let Err(e) = socket.send(Message::Text(hub_protocol::encode_ping())).await {
                    return SessionEnd::Lost(Some(TransportError::SendFailed(e.to_string())));
                }
            }

            _ = time::sleep_until(last_received + slow_after), if !slow_reported => {
                slow_reported = true;
                shared.emit(generation, LifecycleSignal::Slow);
            }

            _ = time::sleep_until(last_received + config.server_timeout) => {
                return SessionEnd::Lost(Some(TransportError::Timeout(format!(
                    "server silent for {:?}",
                    config.server_timeout
                ))));
            }

            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_received = Instant::now();
                        slow_reported = false;

                        if text.len() > config.max_message_size {
                            warn!(
                                "Message too large: {} bytes (max: {})",
                                text.len(),
                                config.max_message_size
                            );
                            continue;
                        }

                        for record in hub_protocol::records(&text) {
                            match hub_protocol::parse_message(record) {
                                Ok(message) => {
                                    if let Some(end) = shared.dispatch(message) {
                                        let _ = socket.close(None).await;
                                        return end;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Dropping malformed hub message"),
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_received = Instant::now();
                    }
                    Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
                        warn!("Ignoring binary frame on a JSON hub connection");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Hub socket closed");
                        return SessionEnd::Lost(None);
                    }
                    Some(Err(WsError::ConnectionClosed)) => {
                        return SessionEnd::Lost(None);
                    }
                    Some(Err(e)) => {
                        return SessionEnd::Lost(Some(TransportError::ReceiveFailed(e.to_string())));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.server_timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert!(config.keep_alive_interval < config.server_timeout);
    }

    #[test]
    fn test_request_url_from_http_base() {
        let options = ConnectOptions::new("https://example.com/", "chat")
            .with_query_string("access_token=abc");
        let request = build_request(&options).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://example.com/chat?access_token=abc"
        );
    }

    #[test]
    fn test_request_carries_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer t".to_string());
        let options = ConnectOptions::new("ws://localhost:5000", "chat").with_headers(headers);

        let request = build_request(&options).unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer t"
        );
    }

    #[test]
    fn test_unsupported_scheme_is_fatal() {
        let options = ConnectOptions::new("ftp://example.com", "chat");
        let error = WebSocketConnector::default().connect(&options).err().unwrap();
        assert!(error.is_fatal());
    }

    #[test]
    fn test_invoke_before_start_is_refused() {
        let connection = WebSocketConnector::default()
            .connect(&ConnectOptions::new("ws://localhost:1", "chat"))
            .unwrap();
        let proxy = connection.create_hub_proxy("chat");

        let result = proxy.invoke(
            "Send",
            vec![],
            Arc::new(|_: Result<Value, TransportError>| {}),
        );
        assert_eq!(result, Err(TransportError::ConnectionClosed));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let connection = WebSocketConnector::default()
            .connect(&ConnectOptions::new("ws://localhost:1", "chat"))
            .unwrap();
        assert!(connection.start(TransportKind::Auto).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error_then_closed() {
        let config = WebSocketConfig {
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        // Bind and drop to obtain a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connection = WebSocketConnector::new(config)
            .connect(&ConnectOptions::new(format!("http://127.0.0.1:{port}"), "chat"))
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_lifecycle(Arc::new(move |signal: LifecycleSignal| {
            let _ = tx.send(signal);
        }));
        connection.start(TransportKind::Auto).unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, LifecycleSignal::Error(_)));
        assert_eq!(rx.recv().await.unwrap(), LifecycleSignal::Closed);
    }
}
