//! Request routing: the dispatcher, its worker pool and its extension points.

pub mod cluster;
pub mod executor;
pub mod forward;
pub mod hooks;
pub mod router;

pub use cluster::{register_cluster_handlers, ClusterClient, CLUSTER_CONTRACT, CLUSTER_MODULE};
pub use executor::ExecutorPool;
pub use forward::{DropUnsupported, ForwardOutcome, ForwardPolicy, ForwardToPeer};
pub use hooks::{BeforeHandle, DefaultIdentityExtractor, IdentityExtractor, LoginGate};
pub use router::Dispatcher;
