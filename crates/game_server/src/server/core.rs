//! Core game server implementation.
//!
//! This module contains the `GameServer` struct and its builder. The builder
//! freezes the protocol registry and wires the dispatcher, the peer links and
//! the cluster view together; the server then owns the listeners, the accept
//! loops and the invocation reaper.

use crate::{
    config::ServerConfig,
    connection::{handle_connection, ConnectionContext, PushService},
    error::ServerError,
    messaging::{
        register_cluster_handlers, BeforeHandle, Dispatcher, DropUnsupported, ExecutorPool, ForwardPolicy,
        ForwardToPeer, IdentityExtractor, LoginGate,
    },
    peer::PeerManager,
};
use futures::stream::{FuturesUnordered, StreamExt as FuturesStreamExt};
use horizon_protocol::{
    ClusterRegistry, IdLayout, InvocationContext, ProtocolId, ProtocolRegistry, SerializerRegistry, SessionManager,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How requests without a local handler are treated.
enum ForwardMode {
    Drop,
    Peers { shards: Option<IdLayout> },
    Custom(Arc<dyn ForwardPolicy>),
}

/// What runs before every handler.
enum HookMode {
    None,
    LoginGate(Vec<ProtocolId>),
    Custom(Arc<dyn BeforeHandle>),
}

/// Startup wiring for a [`GameServer`].
///
/// Everything the dispatcher consults is fixed here; after
/// [`build`](GameServerBuilder::build) the registry is immutable.
pub struct GameServerBuilder {
    config: ServerConfig,
    registry: ProtocolRegistry,
    serializers: SerializerRegistry,
    sessions: Arc<SessionManager>,
    extractor: Option<Arc<dyn IdentityExtractor>>,
    hook: HookMode,
    forward: ForwardMode,
    cluster_handlers: bool,
}

impl GameServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: ProtocolRegistry::new(),
            serializers: SerializerRegistry::default(),
            sessions: Arc::new(SessionManager::new()),
            extractor: None,
            hook: HookMode::None,
            forward: ForwardMode::Drop,
            cluster_handlers: false,
        }
    }

    /// Uses `registry` as the protocol table.
    pub fn registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Gives access to the protocol table for registration.
    pub fn registry_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.registry
    }

    pub fn serializers(mut self, serializers: SerializerRegistry) -> Self {
        self.serializers = serializers;
        self
    }

    /// Shares `sessions` with the server, so handlers registered before
    /// `build` can bind identities.
    pub fn session_manager(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn identity_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Installs the [`LoginGate`]; only `login_protocols` pass without an
    /// identity. Replaces any hook set before.
    pub fn login_gate(mut self, login_protocols: impl IntoIterator<Item = ProtocolId>) -> Self {
        self.hook = HookMode::LoginGate(login_protocols.into_iter().collect());
        self
    }

    /// Installs a custom before-handle hook. Replaces any hook set before.
    pub fn before_handle(mut self, hook: Arc<dyn BeforeHandle>) -> Self {
        self.hook = HookMode::Custom(hook);
        self
    }

    /// Relays requests without a local handler to peers of the declared
    /// target type, picking the least loaded member.
    pub fn forward_to_peers(mut self) -> Self {
        self.forward = ForwardMode::Peers { shards: None };
        self
    }

    /// Like [`forward_to_peers`](Self::forward_to_peers), but identified
    /// callers go to the server whose id is the worker tag of their identity.
    pub fn forward_by_identity_shard(mut self, layout: IdLayout) -> Self {
        self.forward = ForwardMode::Peers { shards: Some(layout) };
        self
    }

    pub fn forward_policy(mut self, policy: Arc<dyn ForwardPolicy>) -> Self {
        self.forward = ForwardMode::Custom(policy);
        self
    }

    /// Serves the built-in cluster membership protocols.
    pub fn with_cluster_handlers(mut self) -> Self {
        self.cluster_handlers = true;
        self
    }

    /// Freezes the registry and assembles the server.
    ///
    /// Must be called inside a Tokio runtime: the business workers start
    /// here.
    ///
    /// # Errors
    ///
    /// `Codec` if the configured default serializer type is not registered,
    /// `Registry` if handler registration or the response-shape check fails.
    pub fn build(self) -> Result<GameServer, ServerError> {
        let GameServerBuilder {
            config,
            mut registry,
            serializers,
            sessions,
            extractor,
            hook,
            forward,
            cluster_handlers,
        } = self;

        let serializers = Arc::new(serializers.with_default_type(config.default_serialize_type)?);
        let clusters = Arc::new(ClusterRegistry::new());
        clusters.register(config.server_info());
        for peer in &config.peers {
            clusters.register(peer.clone());
        }

        if cluster_handlers {
            register_cluster_handlers(&mut registry, clusters.clone())?;
        }
        registry.verify()?;
        let registry = Arc::new(registry);

        let invocations = Arc::new(InvocationContext::new(serializers.clone(), config.rpc_timeout()));
        let peers = Arc::new(PeerManager::new(
            config.peer_config(),
            invocations.clone(),
            clusters.clone(),
        )?);

        let forward: Arc<dyn ForwardPolicy> = match forward {
            ForwardMode::Drop => Arc::new(DropUnsupported),
            ForwardMode::Peers { shards } => {
                let policy = ForwardToPeer::new(registry.clone(), peers.clone());
                Arc::new(match shards {
                    Some(layout) => policy.with_identity_shards(layout),
                    None => policy,
                })
            }
            ForwardMode::Custom(policy) => policy,
        };
        let hook: Option<Arc<dyn BeforeHandle>> = match hook {
            HookMode::None => None,
            HookMode::LoginGate(protocols) => {
                Some(Arc::new(LoginGate::new(protocols, sessions.clone())) as Arc<dyn BeforeHandle>)
            }
            HookMode::Custom(hook) => Some(hook),
        };

        let mut dispatcher = Dispatcher::new(
            registry.clone(),
            ExecutorPool::new(config.worker_threads),
            serializers.clone(),
        )
        .with_before_handle(hook)
        .with_forward_policy(forward);
        if let Some(extractor) = extractor {
            dispatcher = dispatcher.with_identity_extractor(extractor);
        }

        let push = PushService::new(sessions.clone(), serializers.clone());
        let (shutdown_sender, _) = broadcast::channel(1);

        info!(
            "🧩 {} protocols declared, {} handlers bound",
            registry.declared_count(),
            registry.bound_count()
        );

        Ok(GameServer {
            config: Arc::new(config),
            registry,
            serializers,
            sessions,
            invocations,
            clusters,
            peers,
            dispatcher: Arc::new(dispatcher),
            push,
            shutdown_sender,
        })
    }
}

/// The core game server structure.
///
/// `GameServer` owns the listeners and the per-connection tasks, the
/// business worker pool behind its dispatcher, the outbound peer links and
/// the cluster view used to pick them.
pub struct GameServer {
    config: Arc<ServerConfig>,
    registry: Arc<ProtocolRegistry>,
    serializers: Arc<SerializerRegistry>,
    sessions: Arc<SessionManager>,
    invocations: Arc<InvocationContext>,
    clusters: Arc<ClusterRegistry>,
    peers: Arc<PeerManager>,
    dispatcher: Arc<Dispatcher>,
    push: PushService,
    shutdown_sender: broadcast::Sender<()>,
}

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listeners are bound to. Resolves port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until the accept loops have stopped.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!("Accept loop task failed: {}", e);
        }
    }
}

impl GameServer {
    pub fn builder(config: ServerConfig) -> GameServerBuilder {
        GameServerBuilder::new(config)
    }

    /// Binds the listeners and starts accepting connections in the
    /// background.
    ///
    /// If `use_reuse_port` is enabled in configuration, one listener per CPU
    /// core shares the address through `SO_REUSEPORT`.
    ///
    /// # Returns
    ///
    /// A [`ServerHandle`] with the bound address, or a `ServerError` if a
    /// listener could not be set up.
    pub async fn listen(&self) -> Result<ServerHandle, ServerError> {
        info!(
            "🚀 Starting {} server {} on {}",
            self.config.server_type, self.config.server_id, self.config.bind_address
        );
        if self.config.tls.is_some() {
            warn!("🔐 TLS material is configured; terminate TLS in front of this listener");
        }

        let core_count = num_cpus::get();
        let num_acceptors = if self.config.use_reuse_port { core_count } else { 1 };
        info!("🧠 Detected {} CPU cores, using {} acceptor(s)", core_count, num_acceptors);

        let first = bind_listener(self.config.bind_address, self.config.use_reuse_port)?;
        let local_addr = first
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Local address unavailable: {e}")))?;
        let mut listeners = vec![first];
        for _ in 1..num_acceptors {
            listeners.push(bind_listener(local_addr, true)?);
        }
        for i in 0..listeners.len() {
            info!("✅ Listener {} bound on {}", i, local_addr);
        }

        let reaper_period = (self.config.rpc_timeout() / 4).max(std::time::Duration::from_millis(10));
        self.invocations
            .spawn_reaper(reaper_period, self.shutdown_sender.subscribe());

        let ctx = Arc::new(ConnectionContext {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            dispatcher: self.dispatcher.clone(),
            active: Arc::new(AtomicUsize::new(0)),
        });
        let shutdown_sender = self.shutdown_sender.clone();
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let peers = self.peers.clone();

        let task = tokio::spawn(async move {
            let mut accept_futures = listeners
                .into_iter()
                .map(|listener| {
                    let ctx = ctx.clone();
                    let shutdown_sender = shutdown_sender.clone();

                    async move {
                        loop {
                            match listener.accept().await {
                                Ok((stream, addr)) => {
                                    let Some(slot) = ctx.admit() else {
                                        warn!("🚧 Connection limit reached, refusing {}", addr);
                                        continue;
                                    };
                                    stream.set_nodelay(true).ok();
                                    let ctx = ctx.clone();
                                    let shutdown = shutdown_sender.subscribe();

                                    // Spawn individual connection handler
                                    tokio::spawn(async move {
                                        let _slot = slot;
                                        if let Err(e) = handle_connection(stream, addr, ctx, shutdown).await {
                                            error!("Connection error: {}", e);
                                        }
                                    });
                                }
                                Err(e) => {
                                    error!("Failed to accept connection: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                })
                .collect::<FuturesUnordered<_>>();

            tokio::select! {
                _ = accept_futures.next() => {}
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received");
                }
            }

            info!("🧹 Closing peer links...");
            peers.close_all().await;
            info!("Server stopped");
        });

        Ok(ServerHandle { local_addr, task })
    }

    /// Starts the server and runs until [`shutdown`](Self::shutdown) is
    /// called or an accept loop fails.
    pub async fn start(&self) -> Result<(), ServerError> {
        let handle = self.listen().await?;
        handle.stopped().await;
        Ok(())
    }

    /// Stops the accept loops, every connection and the reaper.
    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn serializers(&self) -> &Arc<SerializerRegistry> {
        &self.serializers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn invocations(&self) -> &Arc<InvocationContext> {
        &self.invocations
    }

    pub fn clusters(&self) -> &Arc<ClusterRegistry> {
        &self.clusters
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn push_service(&self) -> &PushService {
        &self.push
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener, ServerError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();

    // Enable SO_REUSEPORT if supported and configured
    if reuse_port {
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
        {
            if let Err(e) = socket.set_reuse_port(true) {
                warn!("Failed to set SO_REUSEPORT: {}", e);
            }
        }
        #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))))]
        {
            warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
        }
    }

    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(65535)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true).ok();

    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}
