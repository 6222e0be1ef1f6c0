//! Bridge errors.

use hubbridge_protocol::{CommandError, ErrorCode};
use hubbridge_transport::TransportError;
use thiserror::Error;

/// Errors returned by bridge operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A connection with this id is already open.
    #[error("Connection already exists: {0}")]
    DuplicateConnection(String),

    /// No connection with this id.
    #[error("Connection not found: {0}")]
    NotFound(String),

    /// A command argument was missing or ill-typed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The server call failed.
    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    /// The transport refused to build or start a connection.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unknown command.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Too many open connections.
    #[error("Connection limit reached: {0}")]
    LimitReached(usize),
}

impl BridgeError {
    /// Wire code reported to the host.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::DuplicateConnection(_) => ErrorCode::DuplicateConnection,
            BridgeError::NotFound(_) => ErrorCode::NotFound,
            BridgeError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            BridgeError::InvocationFailed(_) => ErrorCode::InvocationFailed,
            BridgeError::Transport(_) => ErrorCode::Transport,
            BridgeError::NotImplemented(_) => ErrorCode::NotImplemented,
            BridgeError::LimitReached(_) => ErrorCode::LimitReached,
        }
    }
}

impl From<CommandError> for BridgeError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::UnknownMethod(method) => BridgeError::NotImplemented(method),
            other => BridgeError::InvalidArgument(other.to_string()),
        }
    }
}
