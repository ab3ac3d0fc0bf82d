//! Cluster membership and target selection.
//!
//! Every server process has a [`ServerType`] (gateway, game, battle, ...) and
//! a numeric id. A [`ServerCluster`] groups the live members of one type and
//! a [`ClusterRegistry`] holds one cluster per type. Membership is pushed in
//! by a registration feed and read concurrently by selectors.

mod id;
mod selector;

pub use id::{IdGenerator, IdLayout};
pub use selector::{
    ExplicitIdSelector, HashSelector, IdentityServerSelector, MinLoadSelector, ServerSelector,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Logical role of a server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerType(Cow<'static, str>);

impl ServerType {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServerType {
    fn default() -> Self {
        Self::from_static("game")
    }
}

impl From<&'static str> for ServerType {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for ServerType {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One known server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: u32,
    pub server_type: ServerType,
    pub address: SocketAddr,
    /// Current load, usually the number of online players.
    #[serde(default)]
    pub current_load: u32,
}

impl ServerInfo {
    pub fn new(server_id: u32, server_type: impl Into<ServerType>, address: SocketAddr) -> Self {
        Self {
            server_id,
            server_type: server_type.into(),
            address,
            current_load: 0,
        }
    }

    pub fn with_load(mut self, current_load: u32) -> Self {
        self.current_load = current_load;
        self
    }
}

/// All members of one server type, ordered by server id.
#[derive(Debug)]
pub struct ServerCluster {
    server_type: ServerType,
    members: RwLock<Vec<ServerInfo>>,
}

impl ServerCluster {
    pub fn new(server_type: ServerType) -> Self {
        Self {
            server_type,
            members: RwLock::new(Vec::new()),
        }
    }

    pub fn server_type(&self) -> &ServerType {
        &self.server_type
    }

    /// Adds or replaces a member. Returns `true` if it was not known before.
    pub fn upsert(&self, info: ServerInfo) -> bool {
        let mut members = self.members.write();
        match members.binary_search_by_key(&info.server_id, |member| member.server_id) {
            Ok(index) => {
                members[index] = info;
                false
            }
            Err(index) => {
                members.insert(index, info);
                true
            }
        }
    }

    pub fn remove(&self, server_id: u32) -> Option<ServerInfo> {
        let mut members = self.members.write();
        let index = members
            .binary_search_by_key(&server_id, |member| member.server_id)
            .ok()?;
        Some(members.remove(index))
    }

    /// Returns `false` when the server is not a member.
    pub fn update_load(&self, server_id: u32, current_load: u32) -> bool {
        let mut members = self.members.write();
        match members.binary_search_by_key(&server_id, |member| member.server_id) {
            Ok(index) => {
                members[index].current_load = current_load;
                true
            }
            Err(_) => false,
        }
    }

    pub fn find_by_id(&self, server_id: u32) -> Option<ServerInfo> {
        let members = self.members.read();
        members
            .binary_search_by_key(&server_id, |member| member.server_id)
            .ok()
            .map(|index| members[index].clone())
    }

    /// Picks the member at `hash(key) % member_count`.
    ///
    /// The mapping depends on the member count, so most keys move when a
    /// member joins or leaves.
    pub fn find_by_hash<K: Hash + ?Sized>(&self, key: &K) -> Option<ServerInfo> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.find_by_hash_code(hasher.finish())
    }

    pub fn find_by_hash_code(&self, hash: u64) -> Option<ServerInfo> {
        let members = self.members.read();
        if members.is_empty() {
            return None;
        }
        let index = (hash % members.len() as u64) as usize;
        Some(members[index].clone())
    }

    /// The least loaded member; ties go to the lowest server id.
    pub fn find_min_online_num_server_info(&self) -> Option<ServerInfo> {
        self.members
            .read()
            .iter()
            .min_by_key(|member| member.current_load)
            .cloned()
    }

    pub fn members(&self) -> Vec<ServerInfo> {
        self.members.read().clone()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

/// One [`ServerCluster`] per server type.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: DashMap<ServerType, Arc<ServerCluster>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or refreshes a server. Returns `true` for a new member.
    pub fn register(&self, info: ServerInfo) -> bool {
        let cluster = self.cluster_or_create(&info.server_type);
        let server_id = info.server_id;
        let address = info.address;
        let added = cluster.upsert(info);
        if added {
            info!(
                "🌐 Server {} joined cluster {} at {}",
                server_id,
                cluster.server_type(),
                address
            );
        } else {
            debug!("Server {} of {} refreshed", server_id, cluster.server_type());
        }
        added
    }

    pub fn unregister(&self, server_type: &ServerType, server_id: u32) -> Option<ServerInfo> {
        let removed = self.cluster(server_type)?.remove(server_id);
        if removed.is_some() {
            info!("👋 Server {} left cluster {}", server_id, server_type);
        }
        removed
    }

    pub fn update_load(&self, server_type: &ServerType, server_id: u32, current_load: u32) -> bool {
        self.cluster(server_type)
            .map(|cluster| cluster.update_load(server_id, current_load))
            .unwrap_or(false)
    }

    pub fn cluster(&self, server_type: &ServerType) -> Option<Arc<ServerCluster>> {
        self.clusters.get(server_type).map(|entry| entry.value().clone())
    }

    fn cluster_or_create(&self, server_type: &ServerType) -> Arc<ServerCluster> {
        self.clusters
            .entry(server_type.clone())
            .or_insert_with(|| Arc::new(ServerCluster::new(server_type.clone())))
            .value()
            .clone()
    }

    pub fn server_types(&self) -> Vec<ServerType> {
        let mut types: Vec<_> = self.clusters.iter().map(|entry| entry.key().clone()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: u32, load: u32) -> ServerInfo {
        let address = format!("127.0.0.1:{}", 7000 + id).parse().unwrap();
        ServerInfo::new(id, "game", address).with_load(load)
    }

    #[test]
    fn test_min_load_selection() {
        let cluster = ServerCluster::new("game".into());
        assert!(cluster.find_min_online_num_server_info().is_none());

        cluster.upsert(server(1, 5));
        cluster.upsert(server(2, 1));
        cluster.upsert(server(3, 9));

        let selected = cluster.find_min_online_num_server_info().expect("Cluster is not empty");
        assert_eq!(selected.server_id, 2);
        assert_eq!(selected.current_load, 1);
    }

    #[test]
    fn test_min_load_tie_goes_to_lowest_id() {
        let cluster = ServerCluster::new("game".into());
        cluster.upsert(server(7, 3));
        cluster.upsert(server(4, 3));
        assert_eq!(cluster.find_min_online_num_server_info().unwrap().server_id, 4);
    }

    #[test]
    fn test_members_stay_sorted_and_upsert_replaces() {
        let cluster = ServerCluster::new("game".into());
        assert!(cluster.upsert(server(3, 0)));
        assert!(cluster.upsert(server(1, 0)));
        assert!(!cluster.upsert(server(3, 8)));

        let ids: Vec<_> = cluster.members().iter().map(|m| m.server_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(cluster.find_by_id(3).unwrap().current_load, 8);
        assert!(cluster.find_by_id(2).is_none());
    }

    #[test]
    fn test_find_by_hash_is_stable_for_fixed_membership() {
        let cluster = ServerCluster::new("game".into());
        assert!(cluster.find_by_hash(&42i64).is_none());
        for id in 1..=4 {
            cluster.upsert(server(id, 0));
        }

        let first = cluster.find_by_hash(&42i64).unwrap();
        let second = cluster.find_by_hash(&42i64).unwrap();
        assert_eq!(first, second);
        assert_eq!(cluster.find_by_hash_code(6).unwrap().server_id, 3);
    }

    #[test]
    fn test_registry_feed() {
        let registry = ClusterRegistry::new();
        let game: ServerType = "game".into();

        assert!(registry.register(server(1, 0)));
        assert!(!registry.register(server(1, 2)));
        assert!(registry.update_load(&game, 1, 10));
        assert!(!registry.update_load(&game, 9, 10));
        assert_eq!(registry.cluster(&game).unwrap().find_by_id(1).unwrap().current_load, 10);

        assert!(registry.unregister(&game, 1).is_some());
        assert!(registry.cluster(&game).unwrap().is_empty());
        assert!(registry.cluster(&"battle".into()).is_none());
        assert_eq!(registry.server_types(), vec![game]);
    }

    #[test]
    fn test_server_info_serde() {
        let json = serde_json::to_value(server(2, 4)).unwrap();
        assert_eq!(json["server_type"], "game");
        assert_eq!(json["address"], "127.0.0.1:7002");

        let parsed: ServerInfo = serde_json::from_value(serde_json::json!({
            "server_id": 9,
            "server_type": "battle",
            "address": "10.1.1.1:9000"
        }))
        .unwrap();
        assert_eq!(parsed.current_load, 0);
        assert_eq!(parsed.server_type.as_str(), "battle");
    }
}
