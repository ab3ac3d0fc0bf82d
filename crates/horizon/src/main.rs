//! Main application entry point for the Horizon server
//!
//! Loads the configuration, installs logging, starts the listener and runs
//! until a termination signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use cli::CliArgs;
use config::AppConfig;
use game_server::{ClusterClient, GameServer, ServerConfig};
use horizon_protocol::{IdLayout, ServerInfo};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long in-flight connections get to wind down after a signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The configured server, ready to run.
pub struct Application {
    config: AppConfig,
    server: GameServer,
}

impl Application {
    /// Loads and validates the configuration, installs logging and builds
    /// the server.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(server_id) = args.server_id {
            config.server.server_id = server_id;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {}", e).into());
        }

        logging::setup_logging(&config.logging, args.json_logs)?;

        let server_config: ServerConfig = config.to_server_config()?;
        let mut builder = GameServer::builder(server_config);
        if config.cluster.registration_endpoint {
            builder = builder.with_cluster_handlers();
        }
        if config.cluster.shard_by_identity {
            builder = builder.forward_by_identity_shard(IdLayout::default());
        } else if config.cluster.forward_to_peers {
            builder = builder.forward_to_peers();
        }
        let server = builder.build()?;

        info!(
            "🚀 Horizon v{} - server {} of {}",
            env!("CARGO_PKG_VERSION"),
            config.server.server_id,
            config.server.server_type
        );
        info!("📂 Config: {}", args.config_path.display());

        Ok(Self { config, server })
    }

    /// Runs until a shutdown signal arrives or the listener stops.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  ⏱️ Idle timeout: {}s", self.config.server.connection_timeout);
        info!("  📞 RPC timeout: {}ms", self.config.rpc.timeout_ms);
        info!("  🔗 Static peers: {}", self.config.cluster.peers.len());

        let handle = self.server.listen().await?;
        let local_addr = handle.local_addr();
        info!("✅ Horizon is now running on {}", local_addr);

        let registry = match &self.config.cluster.registry_address {
            Some(address) => {
                let address: SocketAddr = address.parse()?;
                self.announce(address, local_addr).await;
                Some(address)
            }
            None => None,
        };

        info!("🛑 Press Ctrl+C to gracefully shutdown");
        let stopped = handle.stopped();
        tokio::pin!(stopped);

        tokio::select! {
            _ = &mut stopped => {
                warn!("Listener stopped on its own");
                return Ok(());
            }
            signal = signals::wait_for_shutdown_signal() => signal?,
        }

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        if let Some(address) = registry {
            self.withdraw(address).await;
        }
        self.server.shutdown();

        if tokio::time::timeout(SHUTDOWN_GRACE, stopped).await.is_err() {
            warn!("⏳ Listener did not stop within {:?}", SHUTDOWN_GRACE);
        }
        info!("👋 Horizon shutdown complete");
        Ok(())
    }

    /// Registers this server with the cluster registry at `registry`.
    async fn announce(&self, registry: SocketAddr, local_addr: SocketAddr) {
        let config = self.server.config();
        let me = ServerInfo::new(config.server_id, config.server_type.clone(), local_addr);
        let client = ClusterClient::new(&self.server.peers().client(registry));
        match client.register_server(&me).await {
            Ok(_) => info!("🌐 Registered with cluster registry {}", registry),
            Err(e) => warn!("Could not register with {}: {}", registry, e),
        }
    }

    async fn withdraw(&self, registry: SocketAddr) {
        let config = self.server.config();
        let client = ClusterClient::new(&self.server.peers().client(registry));
        if let Err(e) = client
            .unregister_server(config.server_type.clone(), config.server_id)
            .await
        {
            warn!("Could not unregister from {}: {}", registry, e);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
