//! Server orchestration: listeners, accept loops and startup wiring.

pub mod core;

pub use self::core::{GameServer, GameServerBuilder, ServerHandle};
