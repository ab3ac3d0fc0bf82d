//! Live connections and the identities bound to them.
//!
//! A [`Session`] exists for every accepted connection. Handlers and the push
//! service never touch sockets; they hand messages to the session, whose
//! outbound queue is drained by the connection's writer task.
//!
//! Identities are bound to sessions after authentication. A gateway or peer
//! connection may multiplex many identities over one session.

use crate::message::{Message, ProtocolFamily};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Returned when a message is offered to a session whose connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} is closed")]
pub struct SessionClosed(pub SessionId);

/// One live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    remote_addr: SocketAddr,
    family: ProtocolFamily,
    serialize_type: AtomicU8,
    outbound: mpsc::UnboundedSender<Message>,
    identities: RwLock<Vec<i64>>,
    closed: watch::Sender<bool>,
    connected_at: SystemTime,
}

pub type SessionRef = Arc<Session>;

impl Session {
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
        family: ProtocolFamily,
        serialize_type: u8,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            family,
            serialize_type: AtomicU8::new(serialize_type),
            outbound,
            identities: RwLock::new(Vec::new()),
            closed: watch::Sender::new(false),
            connected_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn serialize_type(&self) -> u8 {
        self.serialize_type.load(Ordering::Acquire)
    }

    /// Switches the serializer used for bodies on this connection.
    pub fn set_serialize_type(&self, serialize_type: u8) {
        self.serialize_type.store(serialize_type, Ordering::Release);
    }

    /// Queues `message` for the connection's writer.
    pub fn send(&self, message: Message) -> Result<(), SessionClosed> {
        if self.is_closed() {
            return Err(SessionClosed(self.id));
        }
        self.outbound.send(message).map_err(|_| {
            self.close();
            SessionClosed(self.id)
        })
    }

    /// The first identity bound to this session, if any.
    pub fn primary_identity(&self) -> Option<i64> {
        self.identities.read().first().copied()
    }

    pub fn identities(&self) -> Vec<i64> {
        self.identities.read().clone()
    }

    pub fn has_identity(&self, identity: i64) -> bool {
        self.identities.read().contains(&identity)
    }

    fn add_identity(&self, identity: i64) {
        let mut identities = self.identities.write();
        if !identities.contains(&identity) {
            identities.push(identity);
        }
    }

    fn remove_identity(&self, identity: i64) {
        self.identities.write().retain(|bound| *bound != identity);
    }

    fn take_identities(&self) -> Vec<i64> {
        std::mem::take(&mut *self.identities.write())
    }

    /// Marks the session closed. The connection task observes this through
    /// [`Session::closed`] and tears the socket down.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        // The sender lives in `self`, so the only error is unreachable.
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

/// The session binding boundary: who is connected where.
pub trait SessionRegistry: Send + Sync {
    /// Session currently bound to `identity`.
    fn resolve(&self, identity: i64) -> Option<SessionRef>;

    /// Binds `identity` to `session`, moving it off any previous session.
    /// Returns `false` for identities that cannot be bound (zero or negative).
    fn bind(&self, identity: i64, session: &SessionRef) -> bool;

    /// Releases `identity` if it is still bound to `session_id`.
    fn release(&self, identity: i64, session_id: SessionId) -> bool;
}

/// In-memory session table.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionRef>,
    identities: DashMap<i64, SessionRef>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and tracks a session for a freshly accepted connection.
    pub fn create_session(
        &self,
        remote_addr: SocketAddr,
        family: ProtocolFamily,
        serialize_type: u8,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> SessionRef {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Arc::new(Session::new(id, remote_addr, family, serialize_type, outbound));
        self.sessions.insert(id, session.clone());
        debug!("🔗 {} opened for {} ({})", id, remote_addr, family);
        session
    }

    pub fn get(&self, id: SessionId) -> Option<SessionRef> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Snapshot of all live sessions.
    pub fn sessions(&self) -> Vec<SessionRef> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Forgets the session and releases every identity bound to it.
    ///
    /// Returns the identities that were released.
    pub fn on_disconnect(&self, session: &SessionRef) -> Vec<i64> {
        self.sessions.remove(&session.id());
        let released: Vec<i64> = session
            .take_identities()
            .into_iter()
            .filter(|identity| {
                self.identities
                    .remove_if(identity, |_, bound| bound.id() == session.id())
                    .is_some()
            })
            .collect();
        session.close();
        debug!(
            "🔌 {} closed, released {} identities",
            session.id(),
            released.len()
        );
        released
    }
}

impl SessionRegistry for SessionManager {
    fn resolve(&self, identity: i64) -> Option<SessionRef> {
        self.identities.get(&identity).map(|entry| entry.value().clone())
    }

    fn bind(&self, identity: i64, session: &SessionRef) -> bool {
        if identity <= 0 {
            trace!("Refusing to bind identity {} to {}", identity, session.id());
            return false;
        }
        if let Some(previous) = self.identities.insert(identity, session.clone()) {
            if previous.id() != session.id() {
                previous.remove_identity(identity);
                debug!(
                    "Identity {} moved from {} to {}",
                    identity,
                    previous.id(),
                    session.id()
                );
            }
        }
        session.add_identity(identity);
        true
    }

    fn release(&self, identity: i64, session_id: SessionId) -> bool {
        match self
            .identities
            .remove_if(&identity, |_, bound| bound.id() == session_id)
        {
            Some((_, session)) => {
                session.remove_identity(identity);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(manager: &SessionManager) -> (SessionRef, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        (manager.create_session(addr, ProtocolFamily::External, 0, tx), rx)
    }

    #[test]
    fn test_bind_resolve_release() {
        let manager = SessionManager::new();
        let (first, _rx) = session(&manager);

        assert!(manager.bind(77, &first));
        assert_eq!(manager.resolve(77).map(|s| s.id()), Some(first.id()));
        assert_eq!(first.primary_identity(), Some(77));

        assert!(manager.release(77, first.id()));
        assert!(manager.resolve(77).is_none());
        assert!(first.identities().is_empty());
    }

    #[test]
    fn test_invalid_identities_are_not_bound() {
        let manager = SessionManager::new();
        let (first, _rx) = session(&manager);
        assert!(!manager.bind(0, &first));
        assert!(!manager.bind(-4, &first));
        assert_eq!(manager.identity_count(), 0);
    }

    #[test]
    fn test_rebind_moves_identity() {
        let manager = SessionManager::new();
        let (first, _rx1) = session(&manager);
        let (second, _rx2) = session(&manager);

        manager.bind(5, &first);
        manager.bind(5, &second);

        assert_eq!(manager.resolve(5).map(|s| s.id()), Some(second.id()));
        assert!(!first.has_identity(5));
        // A stale release from the old session must not unbind the new one.
        assert!(!manager.release(5, first.id()));
        assert!(manager.resolve(5).is_some());
    }

    #[test]
    fn test_disconnect_releases_all_identities() {
        let manager = SessionManager::new();
        let (gateway, _rx) = session(&manager);
        for identity in [10, 11, 12] {
            manager.bind(identity, &gateway);
        }

        let mut released = manager.on_disconnect(&gateway);
        released.sort();
        assert_eq!(released, vec![10, 11, 12]);
        assert_eq!(manager.identity_count(), 0);
        assert_eq!(manager.session_count(), 0);
        assert!(gateway.is_closed());
    }

    #[test]
    fn test_send_after_close_fails() {
        let manager = SessionManager::new();
        let (session, mut rx) = session(&manager);

        session
            .send(Message::heartbeat_response(ProtocolFamily::External))
            .expect("Failed to send on open session");
        assert!(rx.try_recv().is_ok());

        session.close();
        assert_eq!(
            session.send(Message::heartbeat_response(ProtocolFamily::External)),
            Err(SessionClosed(session.id()))
        );
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let manager = SessionManager::new();
        let (session, _rx) = session(&manager);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .expect("waiter task panicked");
    }
}
