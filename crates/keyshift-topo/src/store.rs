//! Topology store abstraction
//!
//! The store is the source of truth for keyspace layout and routing
//! metadata. Production deployments back it with a consensus service; the
//! workflow engine only ever talks to it through this trait.

use crate::error::TopoResult;
use crate::shard::{ShardInfo, Tablet, TabletAlias};
use crate::vschema::{KeyspaceVSchema, RoutingRules};
use async_trait::async_trait;
use std::sync::Arc;

/// Metadata store consumed by the workflow engine
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Get a keyspace's VSchema
    async fn get_vschema(&self, keyspace: &str) -> TopoResult<KeyspaceVSchema>;

    /// Replace a keyspace's VSchema
    async fn save_vschema(&self, keyspace: &str, vschema: &KeyspaceVSchema) -> TopoResult<()>;

    /// Shards of a keyspace whose primaries are serving, ordered by key range
    async fn get_serving_shards(&self, keyspace: &str) -> TopoResult<Vec<ShardInfo>>;

    /// Get a tablet record
    async fn get_tablet(&self, alias: &TabletAlias) -> TopoResult<Tablet>;

    /// Get the global routing rules
    async fn get_routing_rules(&self) -> TopoResult<RoutingRules>;

    /// Replace the global routing rules
    async fn save_routing_rules(&self, rules: &RoutingRules) -> TopoResult<()>;

    /// Recompute the cached serving VSchema after a save
    async fn rebuild_serving_vschema(&self) -> TopoResult<()>;

    /// Open the store of a registered external cluster
    async fn external_cluster(&self, name: &str) -> TopoResult<Arc<dyn TopologyStore>>;
}
