//! What happens to requests this process has no handler for.
//!
//! A backend server simply drops them. A gateway relays them to a peer of
//! the type the protocol is declared for, and the peer's answer travels back
//! to the original caller under the caller's own sequence number.

use crate::peer::PeerManager;
use async_trait::async_trait;
use horizon_protocol::codec;
use horizon_protocol::{
    CallContext, IdLayout, IdentityServerSelector, Invocation, Message, MinLoadSelector, ProtocolRegistry, RpcError,
    ServerSelector, SessionRef,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of a forwarding attempt.
#[derive(Debug)]
pub enum ForwardOutcome {
    /// Relayed to the named server.
    Forwarded { server_id: u32 },
    /// Dropped on purpose; nothing is sent back.
    Dropped,
    /// Nobody in the cluster serves the protocol.
    Unsupported,
    /// A capable peer exists but the relay failed.
    Failed(RpcError),
}

/// Routing fallback for unbound protocols.
#[async_trait]
pub trait ForwardPolicy: Send + Sync {
    async fn forward(&self, session: &SessionRef, message: Message, ctx: CallContext) -> ForwardOutcome;
}

/// Drops every unbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropUnsupported;

#[async_trait]
impl ForwardPolicy for DropUnsupported {
    async fn forward(&self, _session: &SessionRef, _message: Message, _ctx: CallContext) -> ForwardOutcome {
        ForwardOutcome::Dropped
    }
}

/// Relays unbound requests to a peer serving the protocol's target type.
///
/// Callers with an identity go to the shard that minted it when identity
/// sharding is enabled; everything else goes to the least loaded member.
#[derive(Debug)]
pub struct ForwardToPeer {
    registry: Arc<ProtocolRegistry>,
    peers: Arc<PeerManager>,
    shards: Option<IdentityServerSelector>,
}

impl ForwardToPeer {
    pub fn new(registry: Arc<ProtocolRegistry>, peers: Arc<PeerManager>) -> Self {
        Self {
            registry,
            peers,
            shards: None,
        }
    }

    /// Routes identified callers by the worker tag of their identity.
    pub fn with_identity_shards(mut self, layout: IdLayout) -> Self {
        self.shards = Some(IdentityServerSelector::new(layout));
        self
    }

    fn selector(&self, ctx: &CallContext) -> &dyn ServerSelector {
        match &self.shards {
            Some(shards) if ctx.has_identity() => shards,
            _ => &MinLoadSelector,
        }
    }
}

#[async_trait]
impl ForwardPolicy for ForwardToPeer {
    async fn forward(&self, session: &SessionRef, message: Message, ctx: CallContext) -> ForwardOutcome {
        let protocol_id = message.protocol_id();
        let Some(descriptor) = self.registry.lookup(protocol_id) else {
            debug!("No declaration for {}, cannot forward", protocol_id);
            return ForwardOutcome::Unsupported;
        };

        let (server, client) = match self.peers.select(descriptor.target(), self.selector(&ctx), &ctx) {
            Ok(selected) => selected,
            Err(e) => return ForwardOutcome::Failed(e),
        };

        let serializers = self.peers.invocations().serializers();
        let body = match serializers.get(session.serialize_type()).and_then(|from| {
            codec::transcode(from.as_ref(), client.serializer().as_ref(), message.body())
        }) {
            Ok(body) => body,
            Err(e) => return ForwardOutcome::Failed(e.into()),
        };

        let (sequence, invocation) = if ctx.expects_response() {
            let sequence = self.peers.invocations().next_sequence_number();
            let invocation = Invocation::forwarding(
                &ctx,
                sequence,
                protocol_id,
                Arc::clone(session),
                client.config().call_timeout,
            );
            (sequence, Some(invocation))
        } else {
            (0, None)
        };

        let request = Message::peer_request(sequence, protocol_id, ctx.identity, body)
            .with_origin_hint(session.remote_addr().to_string());
        match client.send(request, invocation).await {
            Ok(()) => {
                trace!(
                    "↪️ Forwarded {} from {} to server {} seq={}",
                    protocol_id,
                    session.id(),
                    server.server_id,
                    sequence
                );
                ForwardOutcome::Forwarded {
                    server_id: server.server_id,
                }
            }
            Err(e) => ForwardOutcome::Failed(e),
        }
    }
}
