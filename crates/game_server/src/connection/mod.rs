//! Connection lifecycle.
//!
//! Each accepted socket gets one task that detects the protocol, installs the
//! matching framing, registers a [`Session`](horizon_protocol::Session) and
//! then reads frames until the peer leaves, goes idle or the server shuts
//! down. Outbound frames go through the session's queue to a writer task, so
//! handlers on any worker can answer without touching the socket.

pub mod detect;
pub mod push;
pub(crate) mod transport;

pub use detect::{detect, Detection, WEBSOCKET_SIGNATURE};
pub use push::{PushReport, PushService};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::messaging::Dispatcher;
use horizon_protocol::frame::FrameDecoder;
use horizon_protocol::{Message, MessageKind, ProtocolFamily, SessionManager, SessionRef};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// Shared state every connection task needs.
pub(crate) struct ConnectionContext {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub active: Arc<AtomicUsize>,
}

impl ConnectionContext {
    /// Claims a connection slot, or `None` when `max_connections` is reached.
    pub fn admit(&self) -> Option<ConnectionSlot> {
        let max = self.config.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < max).then_some(active + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(&self.active)))
    }
}

/// Releases its connection slot when dropped.
pub(crate) struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serves one accepted connection until it closes.
///
/// # Returns
///
/// `Ok(())` for every orderly end, including rejected preambles, handshake
/// timeouts and idle timeouts. Protocol violations and I/O failures are
/// returned for the accept loop to log; the connection is closed either way
/// and no error frame is sent.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let detection = match tokio::time::timeout(ctx.config.handshake_timeout(), detect::sniff(&stream)).await {
        Err(_) => {
            debug!("⏰ {} sent no preamble within {:?}", addr, ctx.config.handshake_timeout());
            return Ok(());
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(None)) => {
            trace!("{} closed before the preamble", addr);
            return Ok(());
        }
        Ok(Ok(Some(detection))) => detection,
    };

    let decoder = FrameDecoder::new(ctx.config.max_frame_length);
    let (family, (mut reader, mut writer)) = match detection {
        Detection::Binary(family) => (family, transport::binary(stream, addr, decoder)),
        Detection::WebSocket => {
            let upgrade = transport::websocket(stream, addr, decoder);
            match tokio::time::timeout(ctx.config.handshake_timeout(), upgrade).await {
                Ok(halves) => (ProtocolFamily::External, halves?),
                Err(_) => {
                    debug!(
                        "⏰ {} did not finish the WebSocket upgrade within {:?}",
                        addr,
                        ctx.config.handshake_timeout()
                    );
                    return Ok(());
                }
            }
        }
        Detection::Reject(preamble) => {
            warn!("🚫 Closing {}: unrecognized preamble {:02x?}", addr, preamble);
            return Ok(());
        }
        Detection::NeedMore => return Ok(()),
    };

    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
    let session = ctx
        .sessions
        .create_session(addr, family, ctx.config.default_serialize_type, outbound);
    info!("🔗 {} connected from {} ({:?})", session.id(), addr, detection);

    let writer_session = Arc::clone(&session);
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = queue.recv() => match message {
                    Some(message) => {
                        if let Err(e) = writer.send(&message).await {
                            debug!("Write to {} failed: {}", writer_session.id(), e);
                            writer_session.close();
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_session.closed() => break,
            }
        }
        writer.close().await;
    });

    let idle_timeout = ctx.config.idle_timeout();
    let result = loop {
        tokio::select! {
            inbound = tokio::time::timeout(idle_timeout, reader.next()) => match inbound {
                Err(_) => {
                    info!("⏰ {} idle for {:?}, closing", session.id(), idle_timeout);
                    break Ok(());
                }
                Ok(Ok(None)) => break Ok(()),
                Ok(Err(e)) => break Err(e),
                Ok(Ok(Some(message))) => on_inbound(&ctx, &session, message),
            },
            _ = session.closed() => break Ok(()),
            _ = shutdown.recv() => break Ok(()),
        }
    };

    let released = ctx.sessions.on_disconnect(&session);
    let _ = writer_task.await;
    info!(
        "👋 {} disconnected, released {} identities",
        session.id(),
        released.len()
    );
    result
}

/// The heartbeat stage: heartbeats are answered here and never reach the
/// dispatcher.
fn on_inbound(ctx: &Arc<ConnectionContext>, session: &SessionRef, message: Message) {
    match message.kind() {
        MessageKind::HeartbeatRequest => {
            trace!("💓 Heartbeat from {}", session.id());
            let _ = session.send(Message::heartbeat_response(session.family()));
        }
        MessageKind::HeartbeatResponse => {}
        _ => ctx.dispatcher.dispatch(session, message),
    }
}
