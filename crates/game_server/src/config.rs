//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize and customize the game server behavior.

use crate::peer::PeerConfig;
use horizon_protocol::frame::DEFAULT_MAX_FRAME_LENGTH;
use horizon_protocol::{JsonSerializer, ServerInfo, ServerType};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Certificate material for listeners that sit behind TLS termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Optional CA bundle for verifying peer servers.
    pub ca_path: Option<PathBuf>,
}

/// Configuration structure for the game server.
///
/// Contains all necessary parameters to configure server behavior including
/// network settings, cluster identity, connection limits and RPC timings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Id of this server within its cluster
    pub server_id: u32,

    /// Role of this server (gateway, game, battle, ...)
    pub server_type: ServerType,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Idle timeout in seconds; a connection without inbound frames for this
    /// long is closed
    pub connection_timeout: u64,

    /// Whether to use SO_REUSEPORT for multi-threaded accept loops
    pub use_reuse_port: bool,

    /// Number of business workers
    pub worker_threads: usize,

    /// Largest accepted frame, in bytes after the length field
    pub max_frame_length: usize,

    /// Serializer type assigned to new connections
    pub default_serialize_type: u8,

    /// Bound on outbound peer calls, in milliseconds
    pub rpc_timeout_ms: u64,

    /// Heartbeat period of outbound peer links, in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Time a new connection has to send its first two bytes, in milliseconds
    pub handshake_timeout_ms: u64,

    /// Timeout for establishing outbound peer links, in milliseconds
    pub connect_timeout_ms: u64,

    /// TLS material, if the listener is fronted by TLS termination
    pub tls: Option<TlsConfig>,

    /// Statically known peers, registered into the cluster at startup
    pub peers: Vec<ServerInfo>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            server_id: 1,
            server_type: ServerType::default(),
            max_connections: 1000,
            connection_timeout: 60,
            use_reuse_port: false,
            worker_threads: num_cpus::get() * 2,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            default_serialize_type: JsonSerializer::TYPE,
            rpc_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            handshake_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            tls: None,
            peers: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Settings for outbound links to other servers.
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            call_timeout: self.rpc_timeout(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_frame_length: self.max_frame_length,
        }
    }

    /// This server as it appears to the rest of the cluster.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(self.server_id, self.server_type.clone(), self.bind_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.connection_timeout, 60);
        assert!(!config.use_reuse_port);
        assert!(config.worker_threads >= 2);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_serialize_type, 0);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_peer_config_follows_server_config() {
        let config = ServerConfig {
            rpc_timeout_ms: 250,
            heartbeat_interval_ms: 1_000,
            connect_timeout_ms: 100,
            max_frame_length: 1024,
            ..ServerConfig::default()
        };
        let peer = config.peer_config();
        assert_eq!(peer.call_timeout, Duration::from_millis(250));
        assert_eq!(peer.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(peer.connect_timeout, Duration::from_millis(100));
        assert_eq!(peer.max_frame_length, 1024);
    }

    #[test]
    fn test_server_info() {
        let config = ServerConfig {
            server_id: 7,
            server_type: "battle".into(),
            ..ServerConfig::default()
        };
        let info = config.server_info();
        assert_eq!(info.server_id, 7);
        assert_eq!(info.server_type.as_str(), "battle");
        assert_eq!(info.address, config.bind_address);
    }
}
