//! # Horizon Protocol
//!
//! The network-agnostic half of the Horizon cluster transport: everything a
//! server process needs to speak the Horizon wire protocol without owning a
//! socket.
//!
//! ## Core Pieces
//!
//! - **Wire model** ([`message`], [`frame`]): protocol-tagged, length-prefixed
//!   binary frames for the internal (server to server) and external (client to
//!   server) families.
//! - **Codecs** ([`codec`]): a pluggable [`Serializer`] chosen per connection
//!   by its serialize type byte.
//! - **Protocol registry** ([`registry`], [`handler`]): `(module, method)`
//!   protocol ids mapped to handler descriptors and bound handlers.
//! - **Sessions** ([`session`]): live connections and the identities bound to
//!   them.
//! - **Invocation correlation** ([`invocation`]): outstanding peer calls keyed
//!   by sequence number, completed by response frames or by timeout.
//! - **Cluster selection** ([`cluster`]): known servers per type and the
//!   strategies used to pick one.
//!
//! ## Quick Start
//!
//! ```rust
//! use horizon_protocol::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Add { x: i64 }
//!
//! #[derive(Serialize)]
//! struct Sum { x: i64 }
//!
//! let mut registry = ProtocolRegistry::new();
//! registry
//!     .route(
//!         HandlerDescriptor::builder(ProtocolId::new(10, 3), "add_one").target("game").body(),
//!         |args: HandlerArgs<Add>| async move { Ok::<_, HandlerError>(Sum { x: args.body.x + 1 }) },
//!     )
//!     .expect("protocol 10:3 is registered once");
//! registry.verify().expect("response shapes are consistent");
//! ```

pub mod cluster;
pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod handler;
pub mod invocation;
pub mod message;
pub mod registry;
pub mod session;

pub use cluster::{
    ClusterRegistry, ExplicitIdSelector, HashSelector, IdGenerator, IdLayout, IdentityServerSelector,
    MinLoadSelector, ServerCluster, ServerInfo, ServerSelector, ServerType,
};
pub use codec::{DeflateJsonSerializer, JsonSerializer, Serializer, SerializerRegistry};
pub use context::CallContext;
pub use error::{
    ClusterError, CodecError, ErrorCode, ErrorResponse, FrameError, PushError, RegistryError, RpcError,
};
pub use frame::FrameDecoder;
pub use handler::{handler_fn, HandlerArgs, HandlerError, HandlerFuture, PushEnvelope, RawArgs, RequestHandler};
pub use invocation::{decode_response, Invocation, InvocationContext, PendingCall, DEFAULT_RPC_TIMEOUT};
pub use message::{Message, MessageKind, ProtocolFamily, ProtocolId};
pub use registry::{
    DescriptorBuilder, HandlerDescriptor, HandlerMode, ParamBinding, ProtocolRegistry, RequestInvocation,
};
pub use session::{Session, SessionClosed, SessionId, SessionManager, SessionRef, SessionRegistry};
