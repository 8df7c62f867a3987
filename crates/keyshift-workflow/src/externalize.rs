//! Lookup vindex externalization
//!
//! Once a backfill has caught up, the vindex is made readable by clearing
//! its write-only marker. Owned vindexes are kept up to date by their owner
//! table from then on, so their backfill streams are deleted.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::lookup::{BackingTable, PARAM_TABLE, PARAM_WRITE_ONLY};
use crate::resolver::shard_primaries;
use crate::stream::{ControlStatements, StreamRecord, StreamState, STOPPED_AFTER_COPY};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of a successful externalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalizedVindex {
    pub keyspace: String,
    pub vindex: String,
    pub workflow: String,
    /// Whether the backfill streams were deleted
    pub streams_deleted: bool,
}

fn split_qualified(qualified: &str) -> Result<(&str, &str)> {
    match qualified.split('.').collect::<Vec<_>>().as_slice() {
        [keyspace, vindex] if !keyspace.is_empty() && !vindex.is_empty() => {
            Ok((*keyspace, *vindex))
        }
        _ => Err(WorkflowError::validation(format!(
            "vindex name should be of the form keyspace.vindex: {}",
            qualified
        ))),
    }
}

/// Verify the backfill of `keyspace.vindex` and make the vindex readable
pub(crate) async fn externalize_vindex(
    ctx: &EngineContext,
    qualified_vindex: &str,
) -> Result<ExternalizedVindex> {
    let (keyspace, vindex_name) = split_qualified(qualified_vindex)?;

    let mut source_vschema = ctx
        .topo_call(
            format!("GetVSchema({})", keyspace),
            ctx.topo.get_vschema(keyspace),
        )
        .await?;
    let vindex = source_vschema.vindexes.get(vindex_name).ok_or_else(|| {
        WorkflowError::not_found(format!("vindex {} not found in vschema", qualified_vindex))
    })?;
    let backing = BackingTable::parse(
        vindex_name,
        vindex.params.get(PARAM_TABLE).map(String::as_str).unwrap_or_default(),
    )?;
    let owned = vindex.has_owner();
    let workflow = format!("{}{}", backing.table, ctx.config.lookup_workflow_suffix);

    let targets = shard_primaries(ctx, &ctx.topo, &backing.keyspace, &[]).await?;
    let statements = ControlStatements::new(&ctx.config);

    ctx.for_all(&targets, |target| {
        let statements = &statements;
        let workflow = workflow.as_str();
        let backing = &backing;
        async move {
            let query = statements.select_streams(&target.primary.db_name(), workflow);
            let result = ctx.vreplication_exec(&target.primary, &query).await?;
            for record in StreamRecord::from_rows(workflow, target.name(), &result)? {
                verify_stream(&record, owned, backing, target.name())?;
            }
            Ok(())
        }
    })
    .await?;

    if owned {
        ctx.for_all(&targets, |target| {
            let statements = &statements;
            let workflow = workflow.as_str();
            async move {
                let query = statements.delete_streams(&target.primary.db_name(), workflow);
                ctx.vreplication_exec(&target.primary, &query).await?;
                Ok(())
            }
        })
        .await?;
    }

    if let Some(vindex) = source_vschema.vindexes.get_mut(vindex_name) {
        vindex.params.remove(PARAM_WRITE_ONLY);
    }
    ctx.topo_call(
        format!("SaveVSchema({})", keyspace),
        ctx.topo.save_vschema(keyspace, &source_vschema),
    )
    .await?;
    ctx.topo_call("RebuildVSchemaGraph", ctx.topo.rebuild_serving_vschema())
        .await?;
    ctx.metrics.vindexes_externalized.increment(1);

    info!(
        vindex = %qualified_vindex,
        workflow = %workflow,
        streams_deleted = owned,
        "Externalized lookup vindex"
    );
    Ok(ExternalizedVindex {
        keyspace: keyspace.to_string(),
        vindex: vindex_name.to_string(),
        workflow,
        streams_deleted: owned,
    })
}

/// A stream must be Running unless it was told to stop after its copy, in
/// which case it must have stopped for exactly that reason
fn verify_stream(
    record: &StreamRecord,
    owned: bool,
    backing: &BackingTable,
    shard: &str,
) -> Result<()> {
    let mismatch = |message: String| WorkflowError::StateVerification {
        workflow: record.workflow.clone(),
        shard: format!("{}/{}", backing.keyspace, shard),
        stream_id: record.id,
        message,
    };

    if !owned || !record.source.stop_after_copy {
        if record.state != StreamState::Running {
            return Err(mismatch(format!(
                "stream for {}.{} is not in Running state: {}",
                backing.keyspace, backing.table, record.state
            )));
        }
    } else {
        if record.state != StreamState::Stopped {
            return Err(mismatch(format!(
                "stream for {}.{} is not in Stopped state: {}",
                backing.keyspace, backing.table, record.state
            )));
        }
        if !record.message.contains(STOPPED_AFTER_COPY) {
            return Err(mismatch(format!(
                "stream for {}.{} has not finished copying: {}",
                backing.keyspace, backing.table, record.message
            )));
        }
    }
    Ok(())
}
