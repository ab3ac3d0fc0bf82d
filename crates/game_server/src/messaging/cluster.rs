//! Built-in cluster membership endpoint.
//!
//! Servers announce themselves, report their load and leave through the
//! `cluster` protocol module. The handlers feed the local
//! [`ClusterRegistry`], which the selectors read.

use crate::peer::{CallMode, CallProxy, PeerClient, RemoteContract, RemoteMethod};
use horizon_protocol::{
    CallContext, ClusterRegistry, HandlerArgs, HandlerDescriptor, HandlerError, ProtocolId, ProtocolRegistry,
    RegistryError, RpcError, ServerInfo, ServerType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Module id of the cluster protocols.
pub const CLUSTER_MODULE: i16 = 32000;

pub const REGISTER_SERVER: ProtocolId = ProtocolId::new(CLUSTER_MODULE, 1);
pub const UNREGISTER_SERVER: ProtocolId = ProtocolId::new(CLUSTER_MODULE, 2);
pub const REPORT_LOAD: ProtocolId = ProtocolId::new(CLUSTER_MODULE, 3);
pub const LIST_SERVERS: ProtocolId = ProtocolId::new(CLUSTER_MODULE, 4);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterServer {
    pub server_type: ServerType,
    pub server_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLoad {
    pub server_type: ServerType,
    pub server_id: u32,
    pub current_load: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServers {
    pub server_type: ServerType,
}

pub static CLUSTER_CONTRACT: RemoteContract = RemoteContract {
    name: "cluster",
    target: "gateway",
    methods: &[
        RemoteMethod::new("register_server", REGISTER_SERVER, CallMode::Sync),
        RemoteMethod::new("unregister_server", UNREGISTER_SERVER, CallMode::Sync),
        RemoteMethod::new("report_load", REPORT_LOAD, CallMode::Notify),
        RemoteMethod::new("list_servers", LIST_SERVERS, CallMode::Sync),
    ],
};

/// Binds the cluster handlers to `registry`.
///
/// # Errors
///
/// `DuplicateProtocol` if the application already uses the cluster module.
pub fn register_cluster_handlers(
    registry: &mut ProtocolRegistry,
    clusters: Arc<ClusterRegistry>,
) -> Result<(), RegistryError> {
    let feed = clusters.clone();
    registry.route(
        HandlerDescriptor::builder(REGISTER_SERVER, "cluster.register_server").body(),
        move |args: HandlerArgs<ServerInfo>| {
            let clusters = feed.clone();
            async move { Ok::<_, HandlerError>(clusters.register(args.body)) }
        },
    )?;

    let feed = clusters.clone();
    registry.route(
        HandlerDescriptor::builder(UNREGISTER_SERVER, "cluster.unregister_server").body(),
        move |args: HandlerArgs<UnregisterServer>| {
            let clusters = feed.clone();
            async move {
                let removed = clusters.unregister(&args.body.server_type, args.body.server_id);
                Ok::<_, HandlerError>(removed.is_some())
            }
        },
    )?;

    let feed = clusters.clone();
    registry.route(
        HandlerDescriptor::builder(REPORT_LOAD, "cluster.report_load")
            .body()
            .asynchronous(),
        move |args: HandlerArgs<ReportLoad>| {
            let clusters = feed.clone();
            async move {
                let report = args.body;
                clusters.update_load(&report.server_type, report.server_id, report.current_load);
                Ok::<_, HandlerError>(())
            }
        },
    )?;

    registry.route(
        HandlerDescriptor::builder(LIST_SERVERS, "cluster.list_servers").body(),
        move |args: HandlerArgs<ListServers>| {
            let clusters = clusters.clone();
            async move {
                let members = clusters
                    .cluster(&args.body.server_type)
                    .map(|cluster| cluster.members())
                    .unwrap_or_default();
                Ok::<_, HandlerError>(members)
            }
        },
    )?;

    Ok(())
}

/// Typed stub for the cluster contract of one peer.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    proxy: CallProxy,
}

impl ClusterClient {
    pub fn new(peer: &Arc<PeerClient>) -> Self {
        Self {
            proxy: peer.call_proxy(&CLUSTER_CONTRACT),
        }
    }

    /// Announces `server`. Returns `true` if it was not known before.
    pub async fn register_server(&self, server: &ServerInfo) -> Result<bool, RpcError> {
        self.proxy.call(&CallContext::default(), REGISTER_SERVER, server).await
    }

    pub async fn unregister_server(&self, server_type: ServerType, server_id: u32) -> Result<bool, RpcError> {
        let request = UnregisterServer { server_type, server_id };
        self.proxy.call(&CallContext::default(), UNREGISTER_SERVER, &request).await
    }

    pub async fn report_load(&self, server_type: ServerType, server_id: u32, current_load: u32) -> Result<(), RpcError> {
        let report = ReportLoad {
            server_type,
            server_id,
            current_load,
        };
        self.proxy.notify(&CallContext::default(), REPORT_LOAD, &report).await
    }

    pub async fn list_servers(&self, server_type: ServerType) -> Result<Vec<ServerInfo>, RpcError> {
        self.proxy
            .call(&CallContext::default(), LIST_SERVERS, &ListServers { server_type })
            .await
    }
}
