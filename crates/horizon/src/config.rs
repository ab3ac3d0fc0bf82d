//! Configuration management for the Horizon server.
//!
//! This module handles loading, validation, and conversion of server configuration
//! from TOML files and command-line arguments.

use game_server::{ServerConfig, TlsConfig};
use horizon_protocol::codec::{DeflateJsonSerializer, JsonSerializer};
use horizon_protocol::frame::DEFAULT_MAX_FRAME_LENGTH;
use horizon_protocol::{ServerInfo, ServerType};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and cluster identity
    #[serde(default)]
    pub server: ServerSettings,
    /// Outbound call and framing settings
    #[serde(default)]
    pub rpc: RpcSettings,
    /// Peers and gateway behavior
    #[serde(default)]
    pub cluster: ClusterSettings,
    /// Certificate material, when the listener sits behind TLS termination
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    /// Id of this server within its cluster
    pub server_id: u32,
    /// Role of this server (gateway, game, ...)
    pub server_type: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Idle timeout in seconds
    pub connection_timeout: u64,
    /// Whether to use SO_REUSEPORT for multi-threaded accept loops (Linux only)
    pub use_reuse_port: bool,
    /// Business workers; 0 picks twice the core count
    pub worker_threads: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            server_id: 1,
            server_type: ServerType::default().to_string(),
            max_connections: 1000,
            connection_timeout: 60,
            use_reuse_port: false,
            worker_threads: 0,
        }
    }
}

/// Timing and framing for calls between servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_length: usize,
    /// 0 for JSON, 1 for deflate-compressed JSON
    pub default_serialize_type: u8,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            heartbeat_interval_ms: 10_000,
            handshake_timeout_ms: 5_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            default_serialize_type: JsonSerializer::TYPE,
        }
    }
}

/// A statically known peer server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSettings {
    pub server_id: u32,
    pub server_type: String,
    pub address: String,
}

/// Cluster membership and gateway behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Relay requests without a local handler to a peer of the target type
    pub forward_to_peers: bool,
    /// Route identified callers to the server that minted their identity
    pub shard_by_identity: bool,
    /// Serve the cluster registration endpoint
    pub registration_endpoint: bool,
    /// Address of a server serving the registration endpoint to announce this server to
    pub registry_address: Option<String>,
    pub peers: Vec<PeerSettings>,
}

/// Paths to certificate material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the specified path
    /// and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the application configuration to a game server configuration.
    ///
    /// Call [`validate`](Self::validate) first for readable error messages.
    pub fn to_server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let defaults = ServerConfig::default();
        let peers = self
            .cluster
            .peers
            .iter()
            .map(|peer| {
                peer.address
                    .parse::<SocketAddr>()
                    .map(|address| ServerInfo::new(peer.server_id, ServerType::new(peer.server_type.clone()), address))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServerConfig {
            bind_address: self.server.bind_address.parse()?,
            server_id: self.server.server_id,
            server_type: ServerType::new(self.server.server_type.clone()),
            max_connections: self.server.max_connections,
            connection_timeout: self.server.connection_timeout,
            use_reuse_port: self.server.use_reuse_port,
            worker_threads: match self.server.worker_threads {
                0 => defaults.worker_threads,
                n => n,
            },
            max_frame_length: self.rpc.max_frame_length,
            default_serialize_type: self.rpc.default_serialize_type,
            rpc_timeout_ms: self.rpc.timeout_ms,
            heartbeat_interval_ms: self.rpc.heartbeat_interval_ms,
            handshake_timeout_ms: self.rpc.handshake_timeout_ms,
            connect_timeout_ms: self.rpc.connect_timeout_ms,
            tls: self.tls.as_ref().map(|tls| TlsConfig {
                cert_path: PathBuf::from(&tls.cert_path),
                key_path: PathBuf::from(&tls.key_path),
                ca_path: tls.ca_path.as_ref().map(PathBuf::from),
            }),
            peers,
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        if self.server.server_type.trim().is_empty() {
            return Err("Server type cannot be empty".to_string());
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }

        if self.server.connection_timeout == 0 {
            return Err("connection_timeout must be greater than zero".to_string());
        }

        if self.rpc.timeout_ms == 0 {
            return Err("rpc timeout_ms must be greater than zero".to_string());
        }

        if self.rpc.max_frame_length == 0 {
            return Err("max_frame_length must be greater than zero".to_string());
        }

        let known_types = [JsonSerializer::TYPE, DeflateJsonSerializer::TYPE];
        if !known_types.contains(&self.rpc.default_serialize_type) {
            return Err(format!(
                "Unknown serializer type: {}. Must be one of: {known_types:?}",
                self.rpc.default_serialize_type
            ));
        }

        for peer in &self.cluster.peers {
            if peer.address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid address for peer {}: {}", peer.server_id, peer.address));
            }
            if peer.server_type == self.server.server_type && peer.server_id == self.server.server_id {
                return Err(format!(
                    "Peer {} of {} has this server's own id",
                    peer.server_id, peer.server_type
                ));
            }
        }

        if let Some(registry) = &self.cluster.registry_address {
            if registry.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid registry address: {registry}"));
            }
        }

        if let Some(tls) = &self.tls {
            let files = std::iter::once(&tls.cert_path)
                .chain(std::iter::once(&tls.key_path))
                .chain(tls.ca_path.iter());
            for file in files {
                if !Path::new(file).exists() {
                    return Err(format!("TLS file not found: {file}"));
                }
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::fs;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
        assert_eq!(config.server.server_id, 1);
        assert_eq!(config.server.server_type, "game");
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.server.connection_timeout, 60);
        assert!(!config.server.use_reuse_port);
        assert_eq!(config.rpc.timeout_ms, 5_000);
        assert_eq!(config.rpc.default_serialize_type, 0);
        assert!(config.cluster.peers.is_empty());
        assert!(!config.cluster.forward_to_peers);
        assert!(config.tls.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path)
            .await
            .expect("Missing file should yield defaults");
        assert_eq!(config, AppConfig::default());
        assert!(path.exists(), "a default file should be written");

        let reloaded = AppConfig::load_from_file(&path)
            .await
            .expect("Written defaults should load");
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[server]
bind_address = "0.0.0.0:3000"
server_id = 4
server_type = "gateway"
max_connections = 2000
use_reuse_port = true

[rpc]
timeout_ms = 800
default_serialize_type = 1

[cluster]
forward_to_peers = true
shard_by_identity = true

[[cluster.peers]]
server_id = 2
server_type = "game"
address = "10.0.0.2:8080"

[logging]
level = "debug"
json_format = true
"#;

        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        fs::write(temp_file.path(), toml_content)
            .await
            .expect("Failed to write config");

        let config = AppConfig::load_from_file(temp_file.path())
            .await
            .expect("Config should load");

        assert_eq!(config.server.bind_address, "0.0.0.0:3000");
        assert_eq!(config.server.server_id, 4);
        assert_eq!(config.server.server_type, "gateway");
        assert_eq!(config.server.max_connections, 2000);
        assert_eq!(config.server.connection_timeout, 60, "missing keys keep defaults");
        assert!(config.server.use_reuse_port);
        assert_eq!(config.rpc.timeout_ms, 800);
        assert_eq!(config.rpc.heartbeat_interval_ms, 10_000);
        assert_eq!(config.rpc.default_serialize_type, 1);
        assert!(config.cluster.forward_to_peers);
        assert!(config.cluster.shard_by_identity);
        assert_eq!(
            config.cluster.peers,
            vec![PeerSettings {
                server_id: 2,
                server_type: "game".to_string(),
                address: "10.0.0.2:8080".to_string(),
            }]
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_server_config_conversion() {
        let mut app_config = AppConfig::default();
        app_config.server.bind_address = "192.168.1.100:8080".to_string();
        app_config.server.server_id = 9;
        app_config.server.server_type = "battle".to_string();
        app_config.server.worker_threads = 3;
        app_config.rpc.timeout_ms = 250;
        app_config.cluster.peers.push(PeerSettings {
            server_id: 1,
            server_type: "gateway".to_string(),
            address: "192.168.1.1:8080".to_string(),
        });

        let server_config = app_config.to_server_config().expect("Conversion should succeed");

        assert_eq!(server_config.bind_address.to_string(), "192.168.1.100:8080");
        assert_eq!(server_config.server_id, 9);
        assert_eq!(server_config.server_type, ServerType::from_static("battle"));
        assert_eq!(server_config.worker_threads, 3);
        assert_eq!(server_config.rpc_timeout_ms, 250);
        assert_eq!(server_config.peers.len(), 1);
        assert_eq!(server_config.peers[0].address.to_string(), "192.168.1.1:8080");
        assert!(server_config.tls.is_none());
    }

    #[test]
    fn test_zero_workers_means_automatic() {
        let server_config = AppConfig::default()
            .to_server_config()
            .expect("Conversion should succeed");
        assert_eq!(server_config.worker_threads, ServerConfig::default().worker_threads);
    }

    #[test]
    fn test_validation_invalid_bind_address() {
        let mut config = AppConfig::default();
        config.server.bind_address = "invalid_address".to_string();

        let result = config.validate();
        assert!(result.unwrap_err().contains("Invalid bind address"));
    }

    #[test]
    fn test_validation_invalid_peer() {
        let mut config = AppConfig::default();
        config.cluster.peers.push(PeerSettings {
            server_id: 2,
            server_type: "game".to_string(),
            address: "nowhere".to_string(),
        });
        assert!(config.validate().unwrap_err().contains("Invalid address for peer 2"));

        config.cluster.peers[0].address = "127.0.0.1:9000".to_string();
        config.cluster.peers[0].server_id = 1;
        assert!(config.validate().unwrap_err().contains("own id"));
    }

    #[test]
    fn test_validation_zero_timeouts() {
        let mut config = AppConfig::default();
        config.server.connection_timeout = 0;
        assert!(config.validate().unwrap_err().contains("connection_timeout"));

        config.server.connection_timeout = 60;
        config.rpc.timeout_ms = 0;
        assert!(config.validate().unwrap_err().contains("rpc timeout_ms"));
    }

    #[test]
    fn test_validation_unknown_serializer() {
        let mut config = AppConfig::default();
        config.rpc.default_serialize_type = 7;
        assert!(config.validate().unwrap_err().contains("Unknown serializer type"));
    }

    #[test]
    fn test_validation_missing_tls_files() {
        let mut config = AppConfig::default();
        config.tls = Some(TlsSettings {
            cert_path: "/definitely/not/here/cert.pem".to_string(),
            key_path: "/definitely/not/here/key.pem".to_string(),
            ca_path: None,
        });
        assert!(config.validate().unwrap_err().contains("TLS file not found"));

        let cert = NamedTempFile::new().expect("Failed to create cert file");
        let key = NamedTempFile::new().expect("Failed to create key file");
        config.tls = Some(TlsSettings {
            cert_path: cert.path().display().to_string(),
            key_path: key.path().display().to_string(),
            ca_path: None,
        });
        assert!(config.validate().is_ok());
        assert!(config
            .to_server_config()
            .expect("Conversion should succeed")
            .tls
            .is_some());
    }

    #[test]
    fn test_validation_valid_log_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let mut config = AppConfig::default();
            config.logging.level = level.to_string();
            assert!(config.validate().is_ok(), "Level '{}' should be valid", level);
        }

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));
    }
}
