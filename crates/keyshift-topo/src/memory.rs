//! In-memory topology store for testing and development

use crate::error::{TopoError, TopoResult};
use crate::shard::{ShardInfo, Tablet, TabletAlias};
use crate::store::TopologyStore;
use crate::vschema::{KeyspaceVSchema, RoutingRules};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory topology store
///
/// Every saved document bumps a version counter so tests can assert which
/// writes happened.
pub struct MemoryTopology {
    keyspaces: DashMap<String, KeyspaceEntry>,
    tablets: DashMap<TabletAlias, Tablet>,
    routing_rules: RwLock<RoutingRules>,
    routing_rules_version: AtomicU64,
    rebuilds: AtomicU64,
    external_clusters: DashMap<String, Arc<MemoryTopology>>,
}

#[derive(Clone)]
struct KeyspaceEntry {
    vschema: KeyspaceVSchema,
    vschema_version: u64,
    shards: Vec<ShardInfo>,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self {
            keyspaces: DashMap::new(),
            tablets: DashMap::new(),
            routing_rules: RwLock::new(RoutingRules::default()),
            routing_rules_version: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            external_clusters: DashMap::new(),
        }
    }

    // ==================== Fixture Builders ====================

    /// Create (or replace) a keyspace with no shards
    pub fn add_keyspace(&self, keyspace: &str, vschema: KeyspaceVSchema) {
        self.keyspaces.insert(
            keyspace.to_string(),
            KeyspaceEntry {
                vschema,
                vschema_version: 0,
                shards: Vec::new(),
            },
        );
    }

    /// Add a shard to an existing keyspace
    pub fn add_shard(&self, shard: ShardInfo) -> TopoResult<()> {
        let mut entry = self
            .keyspaces
            .get_mut(&shard.keyspace)
            .ok_or_else(|| TopoError::KeyspaceNotFound(shard.keyspace.clone()))?;
        if entry.shards.iter().any(|s| s.name == shard.name) {
            return Err(TopoError::NodeExists(shard.qualified_name()));
        }
        entry.shards.push(shard);
        entry
            .shards
            .sort_by(|a, b| a.key_range.start.cmp(&b.key_range.start));
        Ok(())
    }

    /// Add a shard together with its primary tablet
    pub fn add_shard_with_primary(
        &self,
        keyspace: &str,
        shard: &str,
        primary: Tablet,
    ) -> TopoResult<()> {
        let info = ShardInfo::new(keyspace, shard)?.with_primary(primary.alias.clone());
        self.add_shard(info)?;
        self.add_tablet(primary);
        Ok(())
    }

    pub fn add_tablet(&self, tablet: Tablet) {
        self.tablets.insert(tablet.alias.clone(), tablet);
    }

    pub fn add_external_cluster(&self, name: &str, cluster: Arc<MemoryTopology>) {
        self.external_clusters.insert(name.to_string(), cluster);
    }

    // ==================== Inspection ====================

    /// Number of times a keyspace's VSchema has been saved
    pub fn vschema_version(&self, keyspace: &str) -> u64 {
        self.keyspaces
            .get(keyspace)
            .map(|e| e.vschema_version)
            .unwrap_or(0)
    }

    /// Number of times the routing rules have been saved
    pub fn routing_rules_version(&self) -> u64 {
        self.routing_rules_version.load(Ordering::SeqCst)
    }

    /// Number of serving VSchema rebuilds
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTopology {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopologyStore for MemoryTopology {
    async fn get_vschema(&self, keyspace: &str) -> TopoResult<KeyspaceVSchema> {
        self.keyspaces
            .get(keyspace)
            .map(|e| e.vschema.clone())
            .ok_or_else(|| TopoError::NoNode(format!("/keyspaces/{}/vschema", keyspace)))
    }

    async fn save_vschema(&self, keyspace: &str, vschema: &KeyspaceVSchema) -> TopoResult<()> {
        let mut entry = self
            .keyspaces
            .get_mut(keyspace)
            .ok_or_else(|| TopoError::KeyspaceNotFound(keyspace.to_string()))?;
        entry.vschema = vschema.clone();
        entry.vschema_version += 1;
        debug!(keyspace, version = entry.vschema_version, "Saved vschema");
        Ok(())
    }

    async fn get_serving_shards(&self, keyspace: &str) -> TopoResult<Vec<ShardInfo>> {
        let entry = self
            .keyspaces
            .get(keyspace)
            .ok_or_else(|| TopoError::KeyspaceNotFound(keyspace.to_string()))?;
        Ok(entry
            .shards
            .iter()
            .filter(|s| s.is_primary_serving)
            .cloned()
            .collect())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> TopoResult<Tablet> {
        self.tablets
            .get(alias)
            .map(|t| t.clone())
            .ok_or_else(|| TopoError::TabletNotFound(alias.to_string()))
    }

    async fn get_routing_rules(&self) -> TopoResult<RoutingRules> {
        Ok(self.routing_rules.read().clone())
    }

    async fn save_routing_rules(&self, rules: &RoutingRules) -> TopoResult<()> {
        *self.routing_rules.write() = rules.clone();
        let version = self.routing_rules_version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(version, rules = rules.len(), "Saved routing rules");
        Ok(())
    }

    async fn rebuild_serving_vschema(&self) -> TopoResult<()> {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn external_cluster(&self, name: &str) -> TopoResult<Arc<dyn TopologyStore>> {
        self.external_clusters
            .get(name)
            .map(|c| Arc::clone(c.value()) as Arc<dyn TopologyStore>)
            .ok_or_else(|| TopoError::ExternalClusterNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vschema::Vindex;

    fn primary(keyspace: &str, shard: &str, uid: u32) -> Tablet {
        Tablet::new(TabletAlias::new("zone1", uid), keyspace, shard)
    }

    #[tokio::test]
    async fn test_serving_shards_sorted_by_range() {
        let topo = MemoryTopology::new();
        topo.add_keyspace("sales", KeyspaceVSchema::sharded());
        topo.add_shard_with_primary("sales", "80-", primary("sales", "80-", 200))
            .unwrap();
        topo.add_shard_with_primary("sales", "-80", primary("sales", "-80", 100))
            .unwrap();
        topo.add_shard(ShardInfo::new("sales", "40-80").unwrap().with_serving(false))
            .unwrap();

        let shards = topo.get_serving_shards("sales").await.unwrap();
        let names: Vec<_> = shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["-80", "80-"]);
    }

    #[tokio::test]
    async fn test_duplicate_shard_rejected() {
        let topo = MemoryTopology::new();
        topo.add_keyspace("sales", KeyspaceVSchema::sharded());
        topo.add_shard(ShardInfo::new("sales", "-80").unwrap()).unwrap();
        let err = topo.add_shard(ShardInfo::new("sales", "-80").unwrap()).unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unknown_keyspace() {
        let topo = MemoryTopology::new();
        assert!(topo.get_vschema("nope").await.unwrap_err().is_not_found());
        assert!(topo.get_serving_shards("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_save_vschema_bumps_version() {
        let topo = MemoryTopology::new();
        topo.add_keyspace("sales", KeyspaceVSchema::sharded());
        let vschema = KeyspaceVSchema::sharded().with_vindex("hash", Vindex::new("hash"));
        topo.save_vschema("sales", &vschema).await.unwrap();

        assert_eq!(topo.vschema_version("sales"), 1);
        assert_eq!(topo.get_vschema("sales").await.unwrap(), vschema);
    }

    #[tokio::test]
    async fn test_external_cluster() {
        let topo = MemoryTopology::new();
        let external = Arc::new(MemoryTopology::new());
        external.add_keyspace("legacy", KeyspaceVSchema::unsharded());
        topo.add_external_cluster("ext1", external);

        let store = topo.external_cluster("ext1").await.unwrap();
        assert!(store.get_vschema("legacy").await.is_ok());
        assert!(topo.external_cluster("ext2").await.is_err());
    }
}
