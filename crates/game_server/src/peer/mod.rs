//! Outbound links to other servers in the cluster.
//!
//! A [`PeerClient`] owns at most one connection to one address. The link is
//! opened on first use and reopened by the next send after it drops; there is
//! no automatic retry of a failed send. Each link is served by a single I/O
//! task that writes queued frames, emits heartbeats and feeds response frames
//! into the shared [`InvocationContext`].

pub mod manager;
pub mod proxy;

pub use manager::PeerManager;
pub use proxy::{CallMode, CallProxy, RemoteContract, RemoteMethod};

use crate::connection::transport::{self, FrameReader, FrameWriter};
use horizon_protocol::codec;
use horizon_protocol::frame::{FrameDecoder, DEFAULT_MAX_FRAME_LENGTH};
use horizon_protocol::{
    CallContext, Invocation, InvocationContext, Message, MessageKind, PendingCall, ProtocolFamily, ProtocolId,
    RpcError, Serializer,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, trace, warn};

const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Timing and limits of outbound links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    /// Bound on calls made through the link.
    pub call_timeout: Duration,
    /// Period of heartbeat requests on an open link.
    pub heartbeat_interval: Duration,
    pub max_frame_length: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            call_timeout: horizon_protocol::DEFAULT_RPC_TIMEOUT,
            heartbeat_interval: Duration::from_secs(10),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Client side of the connection to one peer server.
pub struct PeerClient {
    address: SocketAddr,
    config: PeerConfig,
    invocations: Arc<InvocationContext>,
    serializer: Arc<dyn Serializer>,
    link: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pushes: broadcast::Sender<Message>,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("address", &self.address)
            .field("serializer", &self.serializer.name())
            .finish_non_exhaustive()
    }
}

impl PeerClient {
    /// Creates a client for `address`. Nothing is connected until the first
    /// send.
    ///
    /// # Arguments
    ///
    /// * `invocations` - Correlation table shared by every link of this process
    /// * `serializer` - Codec for bodies on this link; both ends must agree
    pub fn new(
        address: SocketAddr,
        config: PeerConfig,
        invocations: Arc<InvocationContext>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            address,
            config,
            invocations,
            serializer,
            link: Mutex::new(None),
            pushes,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn invocations(&self) -> &Arc<InvocationContext> {
        &self.invocations
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }

    /// Sends `message`, registering `invocation` first when given.
    ///
    /// Connects lazily. The invocation is withdrawn again if the message
    /// could not be queued on the link.
    ///
    /// # Errors
    ///
    /// `RpcError::Connection` if the peer can't be reached or the link went
    /// down.
    pub async fn send(&self, message: Message, invocation: Option<Invocation>) -> Result<(), RpcError> {
        let outbound = self.ensure_link().await?;
        let sequence = invocation.as_ref().map(|invocation| invocation.sequence_number);
        if let Some(invocation) = invocation {
            self.invocations.add_invocation(invocation);
        }

        if outbound.send(message).is_err() {
            if let Some(sequence) = sequence {
                self.invocations.remove_invocation(sequence);
            }
            return Err(self.connection_error("link closed"));
        }
        Ok(())
    }

    /// Calls `protocol_id` on the peer and waits for the result, at most for
    /// the configured call timeout.
    pub async fn call<A, R>(&self, ctx: &CallContext, protocol_id: ProtocolId, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.start_call(ctx, protocol_id, args, true).await?.wait().await
    }

    /// Calls `protocol_id` on the peer without waiting.
    pub async fn call_async<A, R>(
        &self,
        ctx: &CallContext,
        protocol_id: ProtocolId,
        args: &A,
    ) -> Result<PendingCall<R>, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.start_call(ctx, protocol_id, args, false).await
    }

    /// Sends `protocol_id` with sequence number 0; nothing is correlated.
    pub async fn notify<A>(&self, ctx: &CallContext, protocol_id: ProtocolId, args: &A) -> Result<(), RpcError>
    where
        A: Serialize + ?Sized,
    {
        let body = codec::encode(self.serializer.as_ref(), args)?;
        self.send(Message::peer_request(0, protocol_id, ctx.identity, body), None)
            .await
    }

    /// Binds `contract` to this link.
    pub fn call_proxy(self: &Arc<Self>, contract: &'static RemoteContract) -> CallProxy {
        CallProxy::new(Arc::clone(self), contract)
    }

    /// Push messages the peer sends on this link.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<Message> {
        self.pushes.subscribe()
    }

    /// Drops the current link. The I/O task flushes what is queued and
    /// closes the socket.
    pub async fn close(&self) {
        if self.link.lock().await.take().is_some() {
            debug!("Closing link to peer {}", self.address);
        }
    }

    async fn start_call<A, R>(
        &self,
        ctx: &CallContext,
        protocol_id: ProtocolId,
        args: &A,
        synchronous: bool,
    ) -> Result<PendingCall<R>, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = codec::encode(self.serializer.as_ref(), args)?;
        let sequence = self.invocations.next_sequence_number();
        let message = Message::peer_request(sequence, protocol_id, ctx.identity, body);
        let (invocation, receiver) =
            Invocation::waiting(ctx, sequence, protocol_id, synchronous, self.config.call_timeout);
        let pending = PendingCall::new(
            &invocation,
            receiver,
            Arc::clone(&self.invocations),
            Arc::clone(&self.serializer),
        );

        self.send(message, Some(invocation)).await?;
        trace!("➡️ Sent {} seq={} to {}", protocol_id, sequence, self.address);
        Ok(pending)
    }

    async fn ensure_link(&self) -> Result<mpsc::UnboundedSender<Message>, RpcError> {
        let mut link = self.link.lock().await;
        if let Some(outbound) = link.as_ref().filter(|outbound| !outbound.is_closed()) {
            return Ok(outbound.clone());
        }

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| {
                self.connection_error(&format!("connect timed out after {:?}", self.config.connect_timeout))
            })?
            .map_err(|e| self.connection_error(&e.to_string()))?;
        stream.set_nodelay(true).ok();

        let (outbound, queue) = mpsc::unbounded_channel();
        let (reader, writer) = transport::binary(
            stream,
            self.address,
            FrameDecoder::new(self.config.max_frame_length),
        );
        tokio::spawn(run_link(LinkTask {
            address: self.address,
            heartbeat_interval: self.config.heartbeat_interval,
            invocations: Arc::clone(&self.invocations),
            serializer: Arc::clone(&self.serializer),
            pushes: self.pushes.clone(),
            reader,
            writer,
            queue,
            in_flight: HashSet::new(),
        }));

        info!("🔗 Connected to peer {}", self.address);
        *link = Some(outbound.clone());
        Ok(outbound)
    }

    fn connection_error(&self, reason: &str) -> RpcError {
        RpcError::Connection {
            address: self.address.to_string(),
            reason: reason.to_string(),
        }
    }
}

struct LinkTask {
    address: SocketAddr,
    heartbeat_interval: Duration,
    invocations: Arc<InvocationContext>,
    serializer: Arc<dyn Serializer>,
    pushes: broadcast::Sender<Message>,
    reader: FrameReader,
    writer: FrameWriter,
    queue: mpsc::UnboundedReceiver<Message>,
    /// Sequence numbers written on this link and not yet answered.
    in_flight: HashSet<i64>,
}

async fn run_link(mut task: LinkTask) {
    let period = task.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = task.reader.next() => match inbound {
                Ok(Some(message)) => {
                    if let Some(reply) = task.on_inbound(message) {
                        if let Err(e) = task.writer.send(&reply).await {
                            warn!("Write to peer {} failed: {}", task.address, e);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("Peer {} closed the link", task.address);
                    break;
                }
                Err(e) => {
                    warn!("Link to peer {} failed: {}", task.address, e);
                    break;
                }
            },
            outbound = task.queue.recv() => match outbound {
                Some(message) => {
                    task.track(&message);
                    if let Err(e) = task.writer.send(&message).await {
                        warn!("Write to peer {} failed: {}", task.address, e);
                        break;
                    }
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                trace!("💓 Heartbeat to {}", task.address);
                let invocations = Arc::clone(&task.invocations);
                task.in_flight.retain(|sequence| invocations.contains(*sequence));
                if let Err(e) = task.writer.send(&Message::heartbeat_request(ProtocolFamily::Internal)).await {
                    warn!("Heartbeat to peer {} failed: {}", task.address, e);
                    break;
                }
            }
        }
    }

    task.writer.close().await;
    task.fail_in_flight();
    debug!("Link to peer {} stopped", task.address);
}

impl LinkTask {
    fn track(&mut self, message: &Message) {
        if message.kind() == MessageKind::Request && message.sequence_number() != 0 {
            self.in_flight.insert(message.sequence_number());
        }
    }

    /// Fails every call still waiting on this link, including requests that
    /// were queued but never written. Later sends see the closed queue.
    fn fail_in_flight(&mut self) {
        self.queue.close();
        while let Ok(message) = self.queue.try_recv() {
            self.track(&message);
        }

        let mut failed = 0;
        for sequence in self.in_flight.drain() {
            let error = RpcError::Connection {
                address: self.address.to_string(),
                reason: "link closed".to_string(),
            };
            if self.invocations.fail_invocation(sequence, error) {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!("🔌 Link to peer {} dropped with {} calls in flight", self.address, failed);
        }
    }

    /// Handles one inbound frame, returning a frame to write back if any.
    fn on_inbound(&mut self, message: Message) -> Option<Message> {
        match message.kind() {
            MessageKind::HeartbeatRequest => Some(Message::heartbeat_response(ProtocolFamily::Internal)),
            MessageKind::HeartbeatResponse => None,
            MessageKind::Response if message.sequence_number() == 0 => {
                // No subscriber is fine.
                let _ = self.pushes.send(message);
                None
            }
            MessageKind::Response => {
                self.in_flight.remove(&message.sequence_number());
                self.invocations.complete(message, self.serializer.as_ref());
                None
            }
            MessageKind::Request => {
                debug!(
                    "Ignoring request {} from peer {} on an outbound link",
                    message.protocol_id(),
                    self.address
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_protocol::{JsonSerializer, SerializerRegistry};

    fn client(address: SocketAddr, config: PeerConfig) -> PeerClient {
        let invocations = Arc::new(InvocationContext::new(
            Arc::new(SerializerRegistry::default()),
            config.call_timeout,
        ));
        PeerClient::new(address, config, invocations, Arc::new(JsonSerializer))
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = client(address, PeerConfig::default());
        let result: Result<serde_json::Value, _> = client
            .call(&CallContext::for_identity(1), ProtocolId::new(10, 1), &())
            .await;
        assert!(matches!(result, Err(RpcError::Connection { .. })));
        assert_eq!(client.invocations().pending_count(), 0);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_link_is_reused_and_reopened() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let address = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move {
            let mut streams = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.expect("Failed to accept");
                streams.push(stream);
            }
            streams
        });

        let client = client(address, PeerConfig::default());
        let ctx = CallContext::default();
        client.notify(&ctx, ProtocolId::new(10, 1), &()).await.expect("First notify should connect");
        client.notify(&ctx, ProtocolId::new(10, 1), &()).await.expect("Second notify should reuse the link");
        assert!(client.is_connected().await);

        client.close().await;
        assert!(!client.is_connected().await);
        client.notify(&ctx, ProtocolId::new(10, 1), &()).await.expect("Notify should reconnect");

        let streams = tokio::time::timeout(Duration::from_secs(2), accepted)
            .await
            .expect("Peer should see two connections")
            .unwrap();
        assert_eq!(streams.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_link_fails_calls_in_flight() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("Failed to accept");
            let mut buffer = [0u8; 256];
            let _ = stream.read(&mut buffer).await;
            // Hang up with the request unanswered.
        });

        let config = PeerConfig {
            call_timeout: Duration::from_secs(5),
            ..PeerConfig::default()
        };
        let client = client(address, config);
        let started = std::time::Instant::now();
        let result: Result<serde_json::Value, _> = client
            .call(&CallContext::for_identity(1), ProtocolId::new(10, 1), &())
            .await;

        assert!(
            matches!(&result, Err(RpcError::Connection { reason, .. }) if reason == "link closed"),
            "got {result:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(2), "call waited for the timeout");
        assert_eq!(client.invocations().pending_count(), 0);
    }
}
