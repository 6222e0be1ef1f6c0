//! Host commands.
//!
//! A request frame carries a method name and a loosely typed argument map.
//! [`Command::parse`] validates that map into a typed command so that a
//! malformed request can still be answered with its sequence number.

use crate::value::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Method names understood by the bridge.
pub mod methods {
    pub const CONNECT_TO_SERVER: &str = "connectToServer";
    pub const RECONNECT: &str = "reconnect";
    pub const STOP: &str = "stop";
    pub const IS_CONNECTED: &str = "isConnected";
    pub const LISTEN_TO_HUB_METHOD: &str = "listenToHubMethod";
    pub const INVOKE_SERVER_METHOD: &str = "invokeServerMethod";
}

/// Errors raised while validating a request's arguments.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// The method name is not a known command.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// The arguments were not a map.
    #[error("Arguments must be a map, got {0}")]
    NotAMap(&'static str),

    /// A required argument is absent.
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    /// An argument has the wrong shape.
    #[error("Invalid argument {field}: expected {expected}, got {found}")]
    InvalidArgument {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// Parameters of a `connectToServer` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub id: String,
    pub base_url: String,
    pub hub_name: String,
    /// Raw query string appended to the endpoint; empty means none.
    pub query_string: String,
    /// Extra request headers; empty means none.
    pub headers: BTreeMap<String, String>,
    /// Transport selector: 0 default, 1 server-sent events, 2 long polling.
    pub transport: i64,
    /// Hub methods to subscribe to right away.
    pub hub_methods: Vec<String>,
}

/// A validated host command. Every command addresses one connection id.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ConnectToServer(ConnectRequest),
    Reconnect {
        id: String,
    },
    Stop {
        id: String,
    },
    IsConnected {
        id: String,
    },
    ListenToHubMethod {
        id: String,
        method: String,
    },
    InvokeServerMethod {
        id: String,
        method: String,
        arguments: Vec<Value>,
    },
}

impl Command {
    /// Validate a request's method and arguments.
    ///
    /// A `null` argument value is treated as an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown methods and for missing or ill-typed
    /// required arguments.
    pub fn parse(method: &str, arguments: &Value) -> Result<Self, CommandError> {
        let empty = BTreeMap::new();
        let map = match arguments {
            Value::Null => &empty,
            Value::Map(map) => map,
            other => return Err(CommandError::NotAMap(other.type_name())),
        };
        let args = Args(map);

        let command = match method {
            methods::CONNECT_TO_SERVER => Command::ConnectToServer(ConnectRequest {
                id: args.id()?,
                base_url: args.required_str("baseUrl")?,
                hub_name: args.required_str("hubName")?,
                query_string: args.optional_str("queryString")?.unwrap_or_default(),
                headers: args.string_map("headers")?,
                transport: args.optional_i64("transport")?.unwrap_or(0),
                hub_methods: args.string_list("hubMethods")?,
            }),
            methods::RECONNECT => Command::Reconnect { id: args.id()? },
            methods::STOP => Command::Stop { id: args.id()? },
            methods::IS_CONNECTED => Command::IsConnected { id: args.id()? },
            methods::LISTEN_TO_HUB_METHOD => Command::ListenToHubMethod {
                id: args.id()?,
                method: args.required_str("methodName")?,
            },
            methods::INVOKE_SERVER_METHOD => Command::InvokeServerMethod {
                id: args.id()?,
                method: args.required_str("methodName")?,
                arguments: args.list("arguments")?,
            },
            other => return Err(CommandError::UnknownMethod(other.to_string())),
        };

        Ok(command)
    }

    /// The wire method name of this command.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Command::ConnectToServer(_) => methods::CONNECT_TO_SERVER,
            Command::Reconnect { .. } => methods::RECONNECT,
            Command::Stop { .. } => methods::STOP,
            Command::IsConnected { .. } => methods::IS_CONNECTED,
            Command::ListenToHubMethod { .. } => methods::LISTEN_TO_HUB_METHOD,
            Command::InvokeServerMethod { .. } => methods::INVOKE_SERVER_METHOD,
        }
    }

    /// The connection id the command addresses.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        match self {
            Command::ConnectToServer(req) => &req.id,
            Command::Reconnect { id }
            | Command::Stop { id }
            | Command::IsConnected { id }
            | Command::ListenToHubMethod { id, .. }
            | Command::InvokeServerMethod { id, .. } => id,
        }
    }

    /// Render the command back into its argument map.
    #[must_use]
    pub fn arguments(&self) -> Value {
        let id = ("Id", Value::from(self.connection_id()));
        match self {
            Command::ConnectToServer(req) => Value::map([
                id,
                ("baseUrl", Value::from(req.base_url.as_str())),
                ("hubName", Value::from(req.hub_name.as_str())),
                ("queryString", Value::from(req.query_string.as_str())),
                (
                    "headers",
                    Value::map(
                        req.headers
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from(v.as_str()))),
                    ),
                ),
                ("transport", Value::Int(req.transport)),
                (
                    "hubMethods",
                    Value::List(req.hub_methods.iter().map(|m| Value::from(m.as_str())).collect()),
                ),
            ]),
            Command::Reconnect { .. } | Command::Stop { .. } | Command::IsConnected { .. } => {
                Value::map([id])
            }
            Command::ListenToHubMethod { method, .. } => {
                Value::map([id, ("methodName", Value::from(method.as_str()))])
            }
            Command::InvokeServerMethod {
                method, arguments, ..
            } => Value::map([
                id,
                ("methodName", Value::from(method.as_str())),
                ("arguments", Value::List(arguments.clone())),
            ]),
        }
    }
}

/// Typed accessors over a request's argument map.
struct Args<'a>(&'a BTreeMap<String, Value>);

impl Args<'_> {
    fn id(&self) -> Result<String, CommandError> {
        match self.0.get("Id").or_else(|| self.0.get("id")) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(CommandError::InvalidArgument {
                field: "Id",
                expected: "string",
                found: other.type_name(),
            }),
            None => Err(CommandError::MissingArgument("Id")),
        }
    }

    fn required_str(&self, field: &'static str) -> Result<String, CommandError> {
        self.optional_str(field)?
            .ok_or(CommandError::MissingArgument(field))
    }

    fn optional_str(&self, field: &'static str) -> Result<Option<String>, CommandError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(invalid(field, "string", other)),
        }
    }

    fn optional_i64(&self, field: &'static str) -> Result<Option<i64>, CommandError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| invalid(field, "integer", v)),
        }
    }

    fn list(&self, field: &'static str) -> Result<Vec<Value>, CommandError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(items.clone()),
            Some(other) => Err(invalid(field, "list", other)),
        }
    }

    fn string_list(&self, field: &'static str) -> Result<Vec<String>, CommandError> {
        self.list(field)?
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(field, "list of strings", item))
            })
            .collect()
    }

    fn string_map(&self, field: &'static str) -> Result<BTreeMap<String, String>, CommandError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(Value::Map(map)) => map
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|s| (k.clone(), s.to_string()))
                        .ok_or_else(|| invalid(field, "map of strings", v))
                })
                .collect(),
            Some(other) => Err(invalid(field, "map", other)),
        }
    }
}

fn invalid(field: &'static str, expected: &'static str, found: &Value) -> CommandError {
    CommandError::InvalidArgument {
        field,
        expected,
        found: found.type_name(),
    }
}
