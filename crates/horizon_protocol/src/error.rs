//! Error types for the wire, codec, registry, RPC and cluster layers.
//!
//! Every failure that can cross the wire is also expressible as an
//! [`ErrorCode`], which is what peers and clients actually see in an error
//! response. The richer enums here stay process-local and are what gets logged.

use crate::cluster::ServerType;
use crate::message::ProtocolId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Numeric error code carried in error responses.
///
/// Codes below 1000 are reserved for the transport itself. Application
/// handlers report domain failures with codes of 1000 and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Unexpected failure. Details are logged on the server, never sent.
    pub const UNKNOWN: ErrorCode = ErrorCode(1);
    /// The handler requires a caller identity and none was bound.
    pub const NO_IDENTITY: ErrorCode = ErrorCode(2);
    /// No handler and no peer can serve the protocol id.
    pub const UNSUPPORTED_PROTOCOL: ErrorCode = ErrorCode(3);
    /// A forwarded call was not answered in time.
    pub const TIMEOUT: ErrorCode = ErrorCode(4);
    /// The request body could not be decoded into the handler's input.
    pub const BAD_REQUEST: ErrorCode = ErrorCode(5);

    /// First code available to application handlers.
    pub const APPLICATION_BASE: i32 = 1000;

    /// Returns `true` for codes owned by the transport.
    pub fn is_system(&self) -> bool {
        self.0 < Self::APPLICATION_BASE
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorCode::UNKNOWN => write!(f, "unknown({})", self.0),
            ErrorCode::NO_IDENTITY => write!(f, "no_identity({})", self.0),
            ErrorCode::UNSUPPORTED_PROTOCOL => write!(f, "unsupported_protocol({})", self.0),
            ErrorCode::TIMEOUT => write!(f, "timeout({})", self.0),
            ErrorCode::BAD_REQUEST => write!(f, "bad_request({})", self.0),
            ErrorCode(code) => write!(f, "{code}"),
        }
    }
}

/// Body of an error response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Framing failures. Any of these on an inbound connection is a protocol
/// violation and closes the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown protocol family tag {0:#06x}")]
    UnknownFamily(u16),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("frame too short: length field {length}, need at least {minimum}")]
    FrameTooShort { length: usize, minimum: usize },
    #[error("frame too large: {length} bytes exceeds limit of {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),
    #[error("origin hint of {0} bytes does not fit the wire format")]
    OriginHintTooLong(usize),
}

/// Serialization failures at the codec boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no serializer registered for type {0}")]
    UnknownSerializer(u8),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Startup wiring failures. These are fatal: the server refuses to start.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("protocol {0} is already registered")]
    DuplicateProtocol(ProtocolId),
    #[error("protocol {0} uses the reserved module 0")]
    ReservedProtocol(ProtocolId),
    #[error("handler {name} ({protocol}) is synchronous but declares no response type")]
    MissingResponseType { protocol: ProtocolId, name: String },
    #[error("handler {protocol} returns {actual} but the declared response shape is {expected}")]
    ResponseTypeMismatch {
        protocol: ProtocolId,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Failures of outbound calls to peer servers.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("call {protocol} (seq {sequence}) timed out after {after:?}")]
    Timeout {
        protocol: ProtocolId,
        sequence: i64,
        after: Duration,
    },
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },
    #[error("remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("call {0} was abandoned before a response arrived")]
    Abandoned(ProtocolId),
    #[error("contract {contract} has no method {protocol}")]
    UnknownMethod {
        contract: &'static str,
        protocol: ProtocolId,
    },
    #[error("method {method} of {contract} is not declared for this call style")]
    CallStyleMismatch {
        contract: &'static str,
        method: &'static str,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl RpcError {
    /// Wire code used when this failure has to be reported to a caller.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RpcError::Timeout { .. } => ErrorCode::TIMEOUT,
            RpcError::Remote { code, .. } => *code,
            RpcError::Cluster(_) => ErrorCode::UNSUPPORTED_PROTOCOL,
            _ => ErrorCode::UNKNOWN,
        }
    }

    /// Message sent to a caller alongside [`error_code`](Self::error_code).
    ///
    /// Only remote errors pass their message through; everything else gets a
    /// fixed text so addresses and OS errors stay in the server log.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Remote { message, .. } => message.clone(),
            other => match other.error_code() {
                ErrorCode::TIMEOUT => "timeout".to_string(),
                ErrorCode::UNSUPPORTED_PROTOCOL => "unsupported protocol".to_string(),
                _ => "unknown error".to_string(),
            },
        }
    }
}

/// Target selection failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("no servers of type {0} are registered")]
    EmptyCluster(ServerType),
    #[error("server {server_id} of type {server_type} is not registered")]
    UnknownServer { server_type: ServerType, server_id: u32 },
    #[error("no server of type {server_type} owns shard {shard}")]
    UnknownShard { server_type: ServerType, shard: u32 },
    #[error("shard selection requires a caller identity")]
    NoIdentity,
}

/// Push delivery failures.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("protocol {0} is not a push protocol (method id must be negative)")]
    NotPushProtocol(ProtocolId),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_codes_are_below_application_base() {
        for code in [
            ErrorCode::UNKNOWN,
            ErrorCode::NO_IDENTITY,
            ErrorCode::UNSUPPORTED_PROTOCOL,
            ErrorCode::TIMEOUT,
            ErrorCode::BAD_REQUEST,
        ] {
            assert!(code.is_system(), "{code} should be a system code");
        }
        assert!(!ErrorCode(1001).is_system());
    }

    #[test]
    fn test_error_response_serializes_code_as_number() {
        let response = ErrorResponse::new(ErrorCode::NO_IDENTITY, "no identity bound");
        let json = serde_json::to_value(&response).expect("Failed to serialize error response");
        assert_eq!(json["code"], 2);
        assert_eq!(json["message"], "no identity bound");
    }

    #[test]
    fn test_wire_message_hides_internal_details() {
        let refused = RpcError::Connection {
            address: "10.0.0.7:9000".to_string(),
            reason: "Connection refused (os error 111)".to_string(),
        };
        assert_eq!(refused.wire_message(), "unknown error");

        let timeout = RpcError::Timeout {
            protocol: ProtocolId::new(10, 3),
            sequence: 91,
            after: Duration::from_millis(250),
        };
        assert_eq!(timeout.wire_message(), "timeout");

        let no_peer = RpcError::Cluster(ClusterError::EmptyCluster(ServerType::from_static("game")));
        assert_eq!(no_peer.wire_message(), "unsupported protocol");

        let remote = RpcError::Remote {
            code: ErrorCode(1200),
            message: "not enough gold".to_string(),
        };
        assert_eq!(remote.wire_message(), "not enough gold");
    }

    #[test]
    fn test_rpc_error_codes() {
        let timeout = RpcError::Timeout {
            protocol: ProtocolId::new(10, 3),
            sequence: 7,
            after: Duration::from_millis(100),
        };
        assert_eq!(timeout.error_code(), ErrorCode::TIMEOUT);

        let remote = RpcError::Remote {
            code: ErrorCode(1200),
            message: "not enough gold".to_string(),
        };
        assert_eq!(remote.error_code(), ErrorCode(1200));
    }
}
