use super::{IdLayout, ServerCluster, ServerInfo};
use crate::context::CallContext;
use crate::error::ClusterError;
use std::fmt;

/// Picks the member of a cluster that should receive a call.
///
/// Selection never retries: an empty cluster or a missing shard fails the
/// call.
pub trait ServerSelector: Send + Sync + fmt::Debug {
    fn select(&self, cluster: &ServerCluster, ctx: &CallContext) -> Result<ServerInfo, ClusterError>;
}

/// Hashes the caller identity over the current members.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSelector;

impl ServerSelector for HashSelector {
    fn select(&self, cluster: &ServerCluster, ctx: &CallContext) -> Result<ServerInfo, ClusterError> {
        cluster
            .find_by_hash(&ctx.identity)
            .ok_or_else(|| ClusterError::EmptyCluster(cluster.server_type().clone()))
    }
}

/// Picks the least loaded member.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinLoadSelector;

impl ServerSelector for MinLoadSelector {
    fn select(&self, cluster: &ServerCluster, _ctx: &CallContext) -> Result<ServerInfo, ClusterError> {
        cluster
            .find_min_online_num_server_info()
            .ok_or_else(|| ClusterError::EmptyCluster(cluster.server_type().clone()))
    }
}

/// Always targets one server id.
#[derive(Debug, Clone, Copy)]
pub struct ExplicitIdSelector {
    pub server_id: u32,
}

impl ExplicitIdSelector {
    pub fn new(server_id: u32) -> Self {
        Self { server_id }
    }
}

impl ServerSelector for ExplicitIdSelector {
    fn select(&self, cluster: &ServerCluster, _ctx: &CallContext) -> Result<ServerInfo, ClusterError> {
        cluster
            .find_by_id(self.server_id)
            .ok_or_else(|| ClusterError::UnknownServer {
                server_type: cluster.server_type().clone(),
                server_id: self.server_id,
            })
    }
}

/// Routes an identity to the server whose id equals the worker tag inside
/// the identity, i.e. the server that minted it.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityServerSelector {
    layout: IdLayout,
}

impl IdentityServerSelector {
    pub fn new(layout: IdLayout) -> Self {
        Self { layout }
    }

    pub fn shard_of(&self, identity: i64) -> u32 {
        self.layout.worker_id(identity)
    }
}

impl ServerSelector for IdentityServerSelector {
    fn select(&self, cluster: &ServerCluster, ctx: &CallContext) -> Result<ServerInfo, ClusterError> {
        if !ctx.has_identity() {
            return Err(ClusterError::NoIdentity);
        }
        let shard = self.shard_of(ctx.identity);
        cluster
            .find_by_id(shard)
            .ok_or_else(|| ClusterError::UnknownShard {
                server_type: cluster.server_type().clone(),
                shard,
            })
    }
}
