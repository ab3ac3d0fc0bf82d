//! # Game Server - Transport and Request Routing
//!
//! The server half of the Horizon cluster core. It accepts connections from
//! game clients and from peer servers, detects their framing, dispatches
//! decoded requests to the handlers of a [`ProtocolRegistry`] and writes the
//! results back. It also holds the outbound side: links to peer servers,
//! typed call proxies over them, and the cluster view used to pick a peer.
//!
//! ## Message Flow
//!
//! 1. A connection's first two bytes select binary framing or a WebSocket upgrade
//! 2. Frames are decoded into [`Message`](horizon_protocol::Message)s on the connection task
//! 3. Heartbeats are answered on the spot
//! 4. Requests are queued on the business worker owning the caller's identity
//! 5. The handler runs there; its result or error is framed and sent back
//!
//! Requests without a local handler are dropped, or relayed to a peer when
//! the server acts as a gateway.
//!
//! ## Example
//!
//! ```rust,no_run
//! use game_server::{GameServer, ServerConfig};
//! use horizon_protocol::{HandlerArgs, HandlerDescriptor, HandlerError, ProtocolId};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = GameServer::builder(ServerConfig::default());
//! builder.registry_mut().route(
//!     HandlerDescriptor::builder(ProtocolId::new(10, 3), "echo.increment").body(),
//!     |args: HandlerArgs<i64>| async move { Ok::<_, HandlerError>(args.body + 1) },
//! )?;
//! let server = builder.build()?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! The server uses structured error types ([`ServerError`]) to categorize failures:
//!
//! * **Network errors** - Binding, accepting and socket failures
//! * **Protocol violations** - Malformed frames; the connection is closed
//! * **Startup errors** - Inconsistent registry or serializer configuration
//!
//! Handler failures never surface here: they become error frames for the
//! caller.
//!
//! [`ProtocolRegistry`]: horizon_protocol::ProtocolRegistry

// Re-export core types and functions for easy access
pub use config::{ServerConfig, TlsConfig};
pub use connection::{PushReport, PushService};
pub use error::ServerError;
pub use messaging::{
    BeforeHandle, ClusterClient, Dispatcher, DropUnsupported, ForwardOutcome, ForwardPolicy, ForwardToPeer,
    IdentityExtractor, LoginGate,
};
pub use peer::{CallMode, CallProxy, PeerClient, PeerConfig, PeerManager, RemoteContract, RemoteMethod};
pub use server::{GameServer, GameServerBuilder, ServerHandle};
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod peer;
pub mod server;
pub mod utils;

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_protocol::{HandlerArgs, HandlerDescriptor, HandlerError, ProtocolId, RegistryError};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_core_server_creation() {
        let server = create_server().expect("Failed to create server");
        assert_eq!(server.registry().bound_count(), 0);
        assert_eq!(server.sessions().session_count(), 0);
        assert_eq!(server.clusters().server_types().len(), 1, "the server registers itself");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cluster_handlers_are_optional() {
        let server = GameServer::builder(ServerConfig::default())
            .with_cluster_handlers()
            .build()
            .expect("Failed to build server");
        assert_eq!(server.registry().bound_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_default_serializer_is_rejected() {
        let config = ServerConfig {
            default_serialize_type: 9,
            ..ServerConfig::default()
        };
        assert!(matches!(create_server_with_config(config), Err(ServerError::Codec(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_response_shape_mismatch_fails_build() {
        let protocol = ProtocolId::new(12, 1);
        let mut builder = GameServer::builder(ServerConfig::default());
        builder.registry_mut().declare_response_shape::<String>(protocol);
        builder
            .registry_mut()
            .route(
                HandlerDescriptor::builder(protocol, "shop.price").body(),
                |args: HandlerArgs<u32>| async move { Ok::<_, HandlerError>(args.body * 2) },
            )
            .expect("Failed to register handler");

        assert!(matches!(
            builder.build(),
            Err(ServerError::Registry(RegistryError::ResponseTypeMismatch { .. }))
        ));
    }
}
