//! Shard and keyspace resolution
//!
//! Turns a [`WorkflowSpec`] into the concrete source and target shards with
//! their primaries. The [`Resolution`] is a snapshot; primaries may change
//! after it was taken and later RPCs surface that as per-shard errors.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::settings::WorkflowSpec;
use keyshift_topo::{KeyspaceVSchema, ShardInfo, Tablet, TopologyStore};
use std::sync::Arc;
use tracing::debug;

/// A serving shard and the tablet currently acting as its primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPrimary {
    pub shard: ShardInfo,
    pub primary: Tablet,
}

impl ShardPrimary {
    pub fn name(&self) -> &str {
        &self.shard.name
    }

    pub fn qualified_name(&self) -> String {
        self.shard.qualified_name()
    }
}

/// Everything later phases need to know about the shards involved
pub struct Resolution {
    pub source_shards: Vec<ShardPrimary>,
    pub target_shards: Vec<ShardPrimary>,
    pub target_vschema: KeyspaceVSchema,
    pub is_partial: bool,
    /// Store the source keyspace lives in; differs from the engine's store
    /// for external clusters
    pub source_topo: Arc<dyn TopologyStore>,
}

impl Resolution {
    /// Primary of the first source shard, used for source schema reads
    pub fn first_source(&self) -> &ShardPrimary {
        &self.source_shards[0]
    }
}

/// Topology store holding `keyspace`, following an external cluster reference
pub(crate) async fn source_store(
    ctx: &EngineContext,
    external_cluster: Option<&str>,
) -> Result<Arc<dyn TopologyStore>> {
    match external_cluster {
        Some(name) => {
            ctx.topo_call(
                format!("ExternalCluster({})", name),
                ctx.topo.external_cluster(name),
            )
            .await
        }
        None => Ok(Arc::clone(&ctx.topo)),
    }
}

/// Serving shards of a keyspace with their primaries
///
/// `subset` restricts the result to the named shards. Every shard must have
/// a primary; missing primaries are reported for all shards at once.
pub(crate) async fn shard_primaries(
    ctx: &EngineContext,
    topo: &Arc<dyn TopologyStore>,
    keyspace: &str,
    subset: &[String],
) -> Result<Vec<ShardPrimary>> {
    let mut shards = ctx
        .topo_call(
            format!("GetServingShards({})", keyspace),
            topo.get_serving_shards(keyspace),
        )
        .await?;
    if !subset.is_empty() {
        shards.retain(|shard| subset.contains(&shard.name));
    }
    if shards.is_empty() {
        return Err(WorkflowError::not_found(format!(
            "no serving shards found for keyspace {}",
            keyspace
        )));
    }

    ctx.for_all(&shards, |shard| {
        let topo = Arc::clone(topo);
        async move {
            let alias = shard.primary_alias.as_ref().ok_or_else(|| {
                WorkflowError::not_found(format!(
                    "shard {} has no primary",
                    shard.qualified_name()
                ))
            })?;
            let primary = ctx
                .topo_call(format!("GetTablet({})", alias), topo.get_tablet(alias))
                .await?;
            Ok(ShardPrimary {
                shard: shard.clone(),
                primary,
            })
        }
    })
    .await
}

/// Resolve the shards of both keyspaces of `spec`
pub(crate) async fn resolve(ctx: &EngineContext, spec: &WorkflowSpec) -> Result<Resolution> {
    let source_topo = source_store(ctx, spec.external_cluster.as_deref()).await?;
    let source_shards = shard_primaries(
        ctx,
        &source_topo,
        &spec.source_keyspace,
        &spec.source_shards,
    )
    .await?;
    let target_shards =
        shard_primaries(ctx, &ctx.topo, &spec.target_keyspace, &spec.source_shards).await?;

    let target_vschema = ctx
        .topo_call(
            format!("GetVSchema({})", spec.target_keyspace),
            ctx.topo.get_vschema(&spec.target_keyspace),
        )
        .await?;
    if target_vschema.sharded {
        for ts in &spec.table_settings {
            if !target_vschema.tables.contains_key(&ts.target_table) {
                return Err(WorkflowError::not_found(format!(
                    "table {} not found in vschema for keyspace {}",
                    ts.target_table, spec.target_keyspace
                )));
            }
        }
    }

    debug!(
        workflow = %spec.workflow,
        sources = source_shards.len(),
        targets = target_shards.len(),
        partial = spec.is_partial(),
        "Resolved shards"
    );

    Ok(Resolution {
        source_shards,
        target_shards,
        target_vschema,
        is_partial: spec.is_partial(),
        source_topo,
    })
}
