//! The wire message model.
//!
//! A [`Message`] is what one frame decodes to. Two protocol families share the
//! same layout: internal messages travel between server processes and carry
//! the caller identity explicitly on requests, external messages travel
//! between clients and servers and rely on the session for identity.
//!
//! Messages are built through the constructors on [`Message`] and are
//! immutable afterwards.

use bytes::Bytes;
use std::fmt;

/// Protocol family, encoded as the 2-byte tag that opens every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// Server to server traffic.
    Internal,
    /// Client to server traffic.
    External,
}

impl ProtocolFamily {
    pub const INTERNAL_TAG: u16 = 0x7F01;
    pub const EXTERNAL_TAG: u16 = 0x7F02;

    /// The tag written at the start of a frame of this family.
    pub fn tag(self) -> u16 {
        match self {
            ProtocolFamily::Internal => Self::INTERNAL_TAG,
            ProtocolFamily::External => Self::EXTERNAL_TAG,
        }
    }

    /// Resolves a frame tag, or `None` if it belongs to no known family.
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            Self::INTERNAL_TAG => Some(ProtocolFamily::Internal),
            Self::EXTERNAL_TAG => Some(ProtocolFamily::External),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Internal => write!(f, "internal"),
            ProtocolFamily::External => write!(f, "external"),
        }
    }
}

/// What a frame means to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    HeartbeatRequest = 3,
    HeartbeatResponse = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            3 => Some(MessageKind::HeartbeatRequest),
            4 => Some(MessageKind::HeartbeatResponse),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_heartbeat(self) -> bool {
        matches!(
            self,
            MessageKind::HeartbeatRequest | MessageKind::HeartbeatResponse
        )
    }
}

/// Identifies a remotely callable operation: a module and a method within it.
///
/// Module 0 is reserved for the transport (heartbeats and error responses).
/// Negative method ids are reserved for push and broadcast protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId {
    pub module: i16,
    pub method: i8,
}

impl ProtocolId {
    /// Carried by heartbeat request and response frames.
    pub const HEARTBEAT: ProtocolId = ProtocolId::new(0, 0);
    /// Carried by error responses; the body is an `ErrorResponse`.
    pub const ERROR: ProtocolId = ProtocolId::new(0, 1);

    pub const fn new(module: i16, method: i8) -> Self {
        Self { module, method }
    }

    /// Push protocols are delivered outside request/response correlation.
    pub fn is_push(&self) -> bool {
        self.method < 0
    }

    pub fn is_reserved(&self) -> bool {
        self.module == 0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.method)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    family: ProtocolFamily,
    kind: MessageKind,
    sequence_number: i64,
    protocol_id: ProtocolId,
    caller_identity: i64,
    origin_hint: Option<String>,
    body: Bytes,
}

impl Message {
    /// A request without caller identity. For internal requests that carry
    /// an identity use [`Message::peer_request`].
    pub fn request(
        family: ProtocolFamily,
        sequence_number: i64,
        protocol_id: ProtocolId,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            family,
            kind: MessageKind::Request,
            sequence_number,
            protocol_id,
            caller_identity: 0,
            origin_hint: None,
            body: body.into(),
        }
    }

    /// An internal request issued on behalf of `caller_identity`.
    pub fn peer_request(
        sequence_number: i64,
        protocol_id: ProtocolId,
        caller_identity: i64,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            caller_identity,
            ..Self::request(ProtocolFamily::Internal, sequence_number, protocol_id, body)
        }
    }

    pub fn response(
        family: ProtocolFamily,
        sequence_number: i64,
        protocol_id: ProtocolId,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            family,
            kind: MessageKind::Response,
            sequence_number,
            protocol_id,
            caller_identity: 0,
            origin_hint: None,
            body: body.into(),
        }
    }

    /// The response to `request`: same family, sequence number and protocol.
    pub fn response_to(request: &Message, body: impl Into<Bytes>) -> Self {
        Self::response(
            request.family,
            request.sequence_number,
            request.protocol_id,
            body,
        )
    }

    /// An error response correlated with `sequence_number`. The body is an
    /// encoded `ErrorResponse`.
    pub fn error_response(
        family: ProtocolFamily,
        sequence_number: i64,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::response(family, sequence_number, ProtocolId::ERROR, body)
    }

    /// Pushes are responses with no correlation.
    pub fn push(family: ProtocolFamily, protocol_id: ProtocolId, body: impl Into<Bytes>) -> Self {
        Self::response(family, 0, protocol_id, body)
    }

    pub fn heartbeat_request(family: ProtocolFamily) -> Self {
        Self::heartbeat(family, MessageKind::HeartbeatRequest)
    }

    pub fn heartbeat_response(family: ProtocolFamily) -> Self {
        Self::heartbeat(family, MessageKind::HeartbeatResponse)
    }

    fn heartbeat(family: ProtocolFamily, kind: MessageKind) -> Self {
        Self {
            family,
            kind,
            sequence_number: 0,
            protocol_id: ProtocolId::HEARTBEAT,
            caller_identity: 0,
            origin_hint: None,
            body: Bytes::new(),
        }
    }

    /// Attaches the address of the connection a proxied call originated from.
    ///
    /// Only internal requests carry an origin hint; on any other message this
    /// returns the message unchanged.
    pub fn with_origin_hint(mut self, origin: impl Into<String>) -> Self {
        if self.carries_caller() {
            self.origin_hint = Some(origin.into());
        }
        self
    }

    /// Rebuilds the message under another family, keeping everything the
    /// target family can carry.
    pub fn into_family(self, family: ProtocolFamily) -> Self {
        let mut message = Self { family, ..self };
        if !message.carries_caller() {
            message.caller_identity = 0;
            message.origin_hint = None;
        }
        message
    }

    /// Internal requests are the only frames with caller identity and origin.
    pub fn carries_caller(&self) -> bool {
        self.family == ProtocolFamily::Internal && self.kind == MessageKind::Request
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn caller_identity(&self) -> i64 {
        self.caller_identity
    }

    pub fn origin_hint(&self) -> Option<&str> {
        self.origin_hint.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Response && self.protocol_id == ProtocolId::ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_protocol_id_value_semantics() {
        let mut handlers = HashMap::new();
        handlers.insert(ProtocolId::new(10, 3), "echo");

        assert_eq!(handlers.get(&ProtocolId::new(10, 3)), Some(&"echo"));
        assert_eq!(handlers.get(&ProtocolId::new(10, 4)), None);
        assert_eq!(ProtocolId::new(10, 3).to_string(), "10:3");
    }

    #[test]
    fn test_push_and_reserved_ids() {
        assert!(ProtocolId::new(5, -1).is_push());
        assert!(!ProtocolId::new(5, 1).is_push());
        assert!(ProtocolId::HEARTBEAT.is_reserved());
        assert!(ProtocolId::ERROR.is_reserved());
        assert!(!ProtocolId::new(1, 0).is_reserved());
    }

    #[test]
    fn test_family_tags() {
        assert_eq!(ProtocolFamily::from_tag(0x7F01), Some(ProtocolFamily::Internal));
        assert_eq!(ProtocolFamily::from_tag(0x7F02), Some(ProtocolFamily::External));
        assert_eq!(ProtocolFamily::from_tag(0x4745), None);
        assert_eq!(ProtocolFamily::External.tag(), 0x7F02);
    }

    #[test]
    fn test_response_to_preserves_correlation() {
        let request = Message::request(ProtocolFamily::External, 42, ProtocolId::new(10, 3), "{}");
        let response = Message::response_to(&request, "{\"x\":2}");

        assert_eq!(response.kind(), MessageKind::Response);
        assert_eq!(response.sequence_number(), 42);
        assert_eq!(response.protocol_id(), ProtocolId::new(10, 3));
        assert_eq!(response.family(), ProtocolFamily::External);
    }

    #[test]
    fn test_origin_hint_only_on_internal_requests() {
        let peer = Message::peer_request(1, ProtocolId::new(2, 1), 99, Bytes::new())
            .with_origin_hint("10.0.0.1:7000");
        assert_eq!(peer.origin_hint(), Some("10.0.0.1:7000"));

        let external = Message::request(ProtocolFamily::External, 1, ProtocolId::new(2, 1), Bytes::new())
            .with_origin_hint("10.0.0.1:7000");
        assert_eq!(external.origin_hint(), None);
    }

    #[test]
    fn test_into_family_strips_caller_fields() {
        let peer = Message::peer_request(3, ProtocolId::new(2, 1), 99, "body")
            .with_origin_hint("10.0.0.1:7000");
        let external = peer.into_family(ProtocolFamily::External);

        assert_eq!(external.caller_identity(), 0);
        assert_eq!(external.origin_hint(), None);
        assert_eq!(external.sequence_number(), 3);
        assert_eq!(external.body().as_ref(), b"body");
    }

    #[test]
    fn test_push_is_uncorrelated_response() {
        let push = Message::push(ProtocolFamily::External, ProtocolId::new(4, -2), "{}");
        assert_eq!(push.kind(), MessageKind::Response);
        assert_eq!(push.sequence_number(), 0);
        assert!(push.protocol_id().is_push());
    }
}
