//! One [`PeerClient`] per peer address, plus cluster-aware selection.

use super::{CallProxy, PeerClient, PeerConfig, RemoteContract};
use dashmap::DashMap;
use horizon_protocol::{
    CallContext, ClusterError, ClusterRegistry, CodecError, InvocationContext, RpcError, Serializer, ServerInfo,
    ServerSelector, ServerType,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct PeerManager {
    config: PeerConfig,
    invocations: Arc<InvocationContext>,
    serializer: Arc<dyn Serializer>,
    clusters: Arc<ClusterRegistry>,
    clients: DashMap<SocketAddr, Arc<PeerClient>>,
}

impl PeerManager {
    /// Creates a manager whose links encode bodies with the default
    /// serializer of `invocations`.
    pub fn new(
        config: PeerConfig,
        invocations: Arc<InvocationContext>,
        clusters: Arc<ClusterRegistry>,
    ) -> Result<Self, CodecError> {
        let serializer = invocations.serializers().default_serializer()?;
        Ok(Self {
            config,
            invocations,
            serializer,
            clusters,
            clients: DashMap::new(),
        })
    }

    pub fn invocations(&self) -> &Arc<InvocationContext> {
        &self.invocations
    }

    pub fn clusters(&self) -> &Arc<ClusterRegistry> {
        &self.clusters
    }

    /// The client for `address`, created on first request.
    pub fn client(&self, address: SocketAddr) -> Arc<PeerClient> {
        self.clients
            .entry(address)
            .or_insert_with(|| {
                debug!("Creating peer client for {}", address);
                Arc::new(PeerClient::new(
                    address,
                    self.config.clone(),
                    Arc::clone(&self.invocations),
                    Arc::clone(&self.serializer),
                ))
            })
            .clone()
    }

    pub fn client_for(&self, server: &ServerInfo) -> Arc<PeerClient> {
        self.client(server.address)
    }

    /// Picks a member of the `server_type` cluster with `selector`.
    ///
    /// # Errors
    ///
    /// `RpcError::Cluster` when the type has no members or the selector
    /// finds no match. Selection is never retried.
    pub fn select(
        &self,
        server_type: &ServerType,
        selector: &dyn ServerSelector,
        ctx: &CallContext,
    ) -> Result<(ServerInfo, Arc<PeerClient>), RpcError> {
        let cluster = self
            .clusters
            .cluster(server_type)
            .ok_or_else(|| ClusterError::EmptyCluster(server_type.clone()))?;
        let server = selector.select(&cluster, ctx)?;
        let client = self.client_for(&server);
        Ok((server, client))
    }

    /// Binds `contract` to a member of its target cluster.
    pub fn select_proxy(
        &self,
        contract: &'static RemoteContract,
        selector: &dyn ServerSelector,
        ctx: &CallContext,
    ) -> Result<CallProxy, RpcError> {
        let server_type = ServerType::from_static(contract.target);
        let (_, client) = self.select(&server_type, selector, ctx)?;
        Ok(client.call_proxy(contract))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Closes every open link.
    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.iter().map(|entry| entry.value().clone()).collect();
        for client in clients {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_protocol::{ExplicitIdSelector, MinLoadSelector, SerializerRegistry};
    use std::time::Duration;

    fn manager() -> PeerManager {
        let invocations = Arc::new(InvocationContext::new(
            Arc::new(SerializerRegistry::default()),
            Duration::from_secs(1),
        ));
        PeerManager::new(PeerConfig::default(), invocations, Arc::new(ClusterRegistry::new()))
            .expect("Default serializer should exist")
    }

    #[test]
    fn test_one_client_per_address() {
        let manager = manager();
        let address: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let first = manager.client(address);
        let second = manager.client(address);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.client_count(), 1);
    }

    #[test]
    fn test_select_uses_cluster_membership() {
        let manager = manager();
        let battle = ServerType::from_static("battle");
        manager
            .clusters()
            .register(ServerInfo::new(1, battle.clone(), "127.0.0.1:7101".parse().unwrap()).with_load(8));
        manager
            .clusters()
            .register(ServerInfo::new(2, battle.clone(), "127.0.0.1:7102".parse().unwrap()).with_load(2));

        let (server, client) = manager
            .select(&battle, &MinLoadSelector, &CallContext::default())
            .expect("Selection should succeed");
        assert_eq!(server.server_id, 2);
        assert_eq!(client.address(), server.address);

        let (server, _) = manager
            .select(&battle, &ExplicitIdSelector::new(1), &CallContext::default())
            .unwrap();
        assert_eq!(server.server_id, 1);
    }

    #[test]
    fn test_select_from_unknown_type_fails() {
        let manager = manager();
        let result = manager.select(
            &ServerType::from_static("chat"),
            &MinLoadSelector,
            &CallContext::default(),
        );
        assert!(matches!(
            result,
            Err(RpcError::Cluster(ClusterError::EmptyCluster(_)))
        ));
    }
}
