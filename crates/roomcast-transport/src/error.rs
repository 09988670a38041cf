//! Transport errors.

use axum::http::StatusCode;
use roomcast_core::{HubError, RegistryError};
use roomcast_protocol::ProtocolError;
use thiserror::Error;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream without a close frame.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No pong within the read deadline, or a write that stalled.
    #[error("Deadline exceeded on {0}")]
    DeadlineExceeded(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The room's hub is gone.
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    /// The room could not be created.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Reasons an upgrade request is refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// Upgrades are only accepted on GET.
    #[error("WebSocket upgrade requires GET")]
    MethodNotAllowed,

    /// `Upgrade: websocket` is missing.
    #[error("Missing or invalid Upgrade header")]
    MissingUpgrade,

    /// `Connection: upgrade` is missing.
    #[error("Missing or invalid Connection header")]
    MissingConnectionUpgrade,

    /// `Sec-WebSocket-Version` is not 13.
    #[error("Unsupported WebSocket version")]
    UnsupportedVersion,

    /// `Sec-WebSocket-Key` is missing or malformed.
    #[error("Missing or invalid Sec-WebSocket-Key")]
    InvalidKey,

    /// The connection cannot be upgraded.
    #[error("Connection is not upgradable")]
    NotUpgradable,
}

impl HandshakeError {
    /// HTTP status to answer the failed request with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
