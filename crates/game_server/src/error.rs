//! Error types for server operations.

use horizon_protocol::{CodecError, FrameError, RegistryError};
use std::net::SocketAddr;

/// Errors that can occur while running the game server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding, accepting or socket-level failures
    #[error("Network error: {0}")]
    Network(String),
    /// Failures inside the server that are not the peer's fault
    #[error("Internal error: {0}")]
    Internal(String),
    /// Startup wiring was inconsistent
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    /// The serializer configuration is unusable
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    /// A peer broke the framing rules; the connection is closed
    #[error("Protocol violation from {addr}: {source}")]
    ProtocolViolation {
        addr: SocketAddr,
        #[source]
        source: FrameError,
    },
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
