//! Extension points of the dispatcher.

use async_trait::async_trait;
use horizon_protocol::{
    CallContext, Message, ProtocolFamily, ProtocolId, Session, SessionManager, SessionRef, SessionRegistry,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolves the caller identity of an inbound message.
pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, session: &Session, message: &Message) -> i64;
}

/// Internal messages carry the identity in their header; external messages
/// use the first identity bound to the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentityExtractor;

impl IdentityExtractor for DefaultIdentityExtractor {
    fn extract(&self, session: &Session, message: &Message) -> i64 {
        match message.family() {
            ProtocolFamily::Internal => message.caller_identity(),
            ProtocolFamily::External => session.primary_identity().unwrap_or(0),
        }
    }
}

/// Runs on the business worker before the handler. Returning `false` drops
/// the message silently.
#[async_trait]
pub trait BeforeHandle: Send + Sync {
    async fn before_handle(&self, session: &SessionRef, message: &Message, ctx: &CallContext) -> bool;
}

/// Keeps unauthenticated callers out.
///
/// Only the login protocols pass until an identity is known. Internal
/// messages name their identity explicitly; when that identity has no live
/// session here (the player reconnected through another gateway, or this
/// server restarted) it is bound to the link the message came in on, so
/// pushes find their way back.
#[derive(Debug, Clone)]
pub struct LoginGate {
    login_protocols: HashSet<ProtocolId>,
    sessions: Arc<SessionManager>,
}

impl LoginGate {
    pub fn new(login_protocols: impl IntoIterator<Item = ProtocolId>, sessions: Arc<SessionManager>) -> Self {
        Self {
            login_protocols: login_protocols.into_iter().collect(),
            sessions,
        }
    }
}

#[async_trait]
impl BeforeHandle for LoginGate {
    async fn before_handle(&self, session: &SessionRef, message: &Message, ctx: &CallContext) -> bool {
        if self.login_protocols.contains(&message.protocol_id()) {
            return true;
        }
        if !ctx.has_identity() {
            debug!(
                "🔒 Dropping {} from unauthenticated {}",
                message.protocol_id(),
                session.remote_addr()
            );
            return false;
        }
        if message.family() == ProtocolFamily::Internal && self.sessions.resolve(ctx.identity).is_none() {
            trace!("Re-binding identity {} to {}", ctx.identity, session.id());
            self.sessions.bind(ctx.identity, session);
        }
        true
    }
}
