//! Utility functions for creating game servers.

use crate::{config::ServerConfig, error::ServerError, server::GameServer};

/// Creates a new game server with default configuration and no handlers.
///
/// # Errors
///
/// Fails only if the default configuration is inconsistent.
pub fn create_server() -> Result<GameServer, ServerError> {
    create_server_with_config(ServerConfig::default())
}

/// Creates a new game server with the given configuration and no handlers.
///
/// Use [`GameServer::builder`] to register handlers.
pub fn create_server_with_config(config: ServerConfig) -> Result<GameServer, ServerError> {
    GameServer::builder(config).build()
}
