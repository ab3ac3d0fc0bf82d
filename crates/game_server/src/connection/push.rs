//! Fan-out delivery of push messages by identity.
//!
//! Pushes are uncorrelated responses (sequence number 0) on a push protocol
//! (negative method id). They go to whatever session an identity is bound to
//! at the moment of the push; identities that are offline are reported back,
//! never queued.

use horizon_protocol::codec;
use horizon_protocol::{
    Message, ProtocolFamily, ProtocolId, PushEnvelope, PushError, SerializerRegistry, SessionManager, SessionRef,
    SessionRegistry,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of a multi-target push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Identities whose session accepted the message.
    pub delivered: Vec<i64>,
    /// Identities with no live session.
    pub missing: Vec<i64>,
}

/// Sends push messages to identities through their sessions.
#[derive(Debug, Clone)]
pub struct PushService {
    sessions: Arc<SessionManager>,
    serializers: Arc<SerializerRegistry>,
}

impl PushService {
    pub fn new(sessions: Arc<SessionManager>, serializers: Arc<SerializerRegistry>) -> Self {
        Self { sessions, serializers }
    }

    /// Pushes `payload` to one identity.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the identity's session accepted the message, `Ok(false)`
    /// if the identity is offline.
    pub fn push<T: Serialize + ?Sized>(
        &self,
        identity: i64,
        protocol_id: ProtocolId,
        payload: &T,
    ) -> Result<bool, PushError> {
        let report = self.push_many(&[identity], protocol_id, payload)?;
        Ok(!report.delivered.is_empty())
    }

    /// Pushes `payload` to every listed identity.
    ///
    /// The payload is serialized once per serializer type in use. Client
    /// sessions get the bare payload. Identities reached through a gateway
    /// link share one frame on it, wrapped in a [`PushEnvelope`] whose
    /// `targets` lists them so the gateway can fan it out.
    pub fn push_many<T: Serialize + ?Sized>(
        &self,
        identities: &[i64],
        protocol_id: ProtocolId,
        payload: &T,
    ) -> Result<PushReport, PushError> {
        if !protocol_id.is_push() {
            return Err(PushError::NotPushProtocol(protocol_id));
        }
        let value = serde_json::to_value(payload).map_err(horizon_protocol::CodecError::from)?;
        let mut encoded: HashMap<u8, Bytes> = HashMap::new();
        let mut sent_to = HashSet::new();
        let mut links: Vec<(SessionRef, Vec<i64>)> = Vec::new();
        let mut undelivered = HashSet::new();

        for &identity in identities {
            let Some(session) = self.sessions.resolve(identity) else {
                trace!("Push {} to offline identity {}", protocol_id, identity);
                undelivered.insert(identity);
                continue;
            };
            if session.family() == ProtocolFamily::Internal {
                match links.iter_mut().find(|(link, _)| link.id() == session.id()) {
                    Some((_, targets)) => targets.push(identity),
                    None => links.push((session, vec![identity])),
                }
                continue;
            }
            if !sent_to.insert(session.id()) {
                continue;
            }

            let body = match encoded.get(&session.serialize_type()) {
                Some(body) => body.clone(),
                None => {
                    let body = self.encode(session.serialize_type(), &value)?;
                    encoded.insert(session.serialize_type(), body.clone());
                    body
                }
            };
            if session.send(Message::push(session.family(), protocol_id, body)).is_err() {
                undelivered.insert(identity);
            }
        }

        for (link, targets) in links {
            if !self.send_envelope(&link, protocol_id, targets.clone(), &value)? {
                undelivered.extend(targets);
            }
        }

        let mut report = PushReport::default();
        for &identity in identities {
            if undelivered.contains(&identity) {
                report.missing.push(identity);
            } else {
                report.delivered.push(identity);
            }
        }

        debug!(
            "📣 Push {} delivered to {}/{} identities",
            protocol_id,
            report.delivered.len(),
            identities.len()
        );
        Ok(report)
    }

    /// Pushes `payload` to every session that has an identity bound.
    ///
    /// Gateway links get one envelope addressed to every identity bound
    /// through them.
    ///
    /// # Returns
    ///
    /// The number of sessions that accepted the message.
    pub fn broadcast<T: Serialize + ?Sized>(&self, protocol_id: ProtocolId, payload: &T) -> Result<usize, PushError> {
        if !protocol_id.is_push() {
            return Err(PushError::NotPushProtocol(protocol_id));
        }
        let value = serde_json::to_value(payload).map_err(horizon_protocol::CodecError::from)?;
        let mut encoded: HashMap<u8, Bytes> = HashMap::new();
        let mut delivered = 0;

        for session in self.sessions.sessions() {
            if session.primary_identity().is_none() {
                continue;
            }
            if session.family() == ProtocolFamily::Internal {
                if self.send_envelope(&session, protocol_id, session.identities(), &value)? {
                    delivered += 1;
                }
                continue;
            }
            let body = match encoded.get(&session.serialize_type()) {
                Some(body) => body.clone(),
                None => {
                    let body = self.encode(session.serialize_type(), &value)?;
                    encoded.insert(session.serialize_type(), body.clone());
                    body
                }
            };
            if session.send(Message::push(session.family(), protocol_id, body)).is_ok() {
                delivered += 1;
            }
        }

        debug!("📣 Broadcast {} reached {} sessions", protocol_id, delivered);
        Ok(delivered)
    }

    fn send_envelope(
        &self,
        link: &SessionRef,
        protocol_id: ProtocolId,
        targets: Vec<i64>,
        value: &Value,
    ) -> Result<bool, PushError> {
        let envelope = PushEnvelope { targets, body: value.clone() };
        let value = serde_json::to_value(&envelope).map_err(horizon_protocol::CodecError::from)?;
        let body = self.encode(link.serialize_type(), &value)?;
        trace!("Push {} to {} identities via {}", protocol_id, envelope.targets.len(), link.remote_addr());
        Ok(link.send(Message::push(link.family(), protocol_id, body)).is_ok())
    }

    fn encode(&self, serialize_type: u8, value: &Value) -> Result<Bytes, PushError> {
        let serializer = self.serializers.get(serialize_type)?;
        Ok(codec::encode(serializer.as_ref(), value)?)
    }
}
