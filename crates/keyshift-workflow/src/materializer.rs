//! Stream lifecycle
//!
//! Creating a workflow runs a fixed sequence of phases. Every phase fans out
//! over the shards involved and completes on all of them before the next
//! one starts:
//!
//! 1. the workflow name must be unused in the target keyspace
//! 2. shards are resolved
//! 3. the target time zone conversion is checked (MoveTables with a source zone)
//! 4. missing target tables are created
//! 5. one insert per target shard is generated
//! 6. the journal is checked for a previous run (MoveTables, local source)
//! 7. streams are inserted in state Stopped
//! 8. streams are started, unless the workflow asks otherwise
//!
//! A failure on some shards does not undo the work already done on others.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::filter::build_rules;
use crate::journal::{candidate_streams, check_previous_journal, migration_id};
use crate::resolver::{resolve, shard_primaries, Resolution, ShardPrimary};
use crate::schema::SchemaDeployer;
use crate::settings::{MigrationIntent, WorkflowSpec};
use crate::sql::encode_string;
use crate::stream::{
    key_range_slot, BinlogSource, ControlStatements, Filter, InsertGenerator, StreamTemplate,
    WorkflowSubType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Outcome of a successful workflow creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedWorkflow {
    pub workflow: String,
    pub target_keyspace: String,
    /// Streams created per target shard, in key range order
    pub streams: Vec<(String, usize)>,
    pub started: bool,
}

impl CreatedWorkflow {
    pub fn total_streams(&self) -> usize {
        self.streams.iter().map(|(_, n)| n).sum()
    }
}

/// Create the streams of `spec` and start them if requested
pub(crate) async fn create_workflow(
    ctx: &EngineContext,
    spec: &WorkflowSpec,
) -> Result<CreatedWorkflow> {
    spec.validate()?;
    validate_new_workflow(ctx, &spec.target_keyspace, &spec.workflow).await?;

    let resolution = resolve(ctx, spec).await?;
    if spec.intent == MigrationIntent::MoveTables {
        if let Some(zone) = &spec.source_time_zone {
            check_time_zone_conversion(ctx, &resolution.target_shards, zone).await?;
        }
    }

    SchemaDeployer::new(ctx, spec, &resolution).deploy().await?;
    let templates = generate_inserts(ctx, spec, &resolution)?;

    if spec.intent == MigrationIntent::MoveTables && spec.external_cluster.is_none() {
        let streams = candidate_streams(
            resolution
                .target_shards
                .iter()
                .zip(&templates)
                .map(|(target, template)| (target.name(), template.rows())),
        );
        let id = migration_id(&spec.target_keyspace, &streams);
        check_previous_journal(
            ctx,
            &resolution.source_shards,
            id,
            &spec.target_keyspace,
            &spec.workflow,
        )
        .await?;
    }

    let batches: Vec<(&ShardPrimary, &StreamTemplate)> =
        resolution.target_shards.iter().zip(&templates).collect();
    ctx.for_all(&batches, |(target, template)| async move {
        if template.is_empty() {
            return Ok(());
        }
        let sql = template.render(&target.shard.key_range, &target.primary.db_name());
        ctx.vreplication_exec(&target.primary, &sql).await?;
        ctx.metrics.streams_created.increment(template.rows() as u64);
        Ok(())
    })
    .await?;

    let streams: Vec<(String, usize)> = batches
        .iter()
        .map(|(target, template)| (target.name().to_string(), template.rows()))
        .collect();
    info!(
        workflow = %spec.workflow,
        keyspace = %spec.target_keyspace,
        streams = streams.iter().map(|(_, n)| n).sum::<usize>(),
        "Created streams"
    );

    if spec.auto_start {
        start_streams(ctx, &spec.workflow, &resolution.target_shards).await?;
    }

    Ok(CreatedWorkflow {
        workflow: spec.workflow.clone(),
        target_keyspace: spec.target_keyspace.clone(),
        streams,
        started: spec.auto_start,
    })
}

/// Reject workflow names already in use, and keyspaces with frozen workflows
pub(crate) async fn validate_new_workflow(
    ctx: &EngineContext,
    keyspace: &str,
    workflow: &str,
) -> Result<()> {
    let shards = shard_primaries(ctx, &ctx.topo, keyspace, &[]).await?;
    let statements = ControlStatements::new(&ctx.config);

    ctx.for_all(&shards, |target| {
        let statements = &statements;
        async move {
            let db_name = target.primary.db_name();
            let existing = ctx
                .vreplication_exec(&target.primary, &statements.workflow_exists(&db_name, workflow))
                .await?;
            if !existing.is_empty() {
                return Err(WorkflowError::conflict(format!(
                    "workflow {} already exists in keyspace {} on tablet {}",
                    workflow, keyspace, target.primary.alias
                )));
            }
            let frozen = ctx
                .vreplication_exec(&target.primary, &statements.frozen_workflows(&db_name))
                .await?;
            if !frozen.is_empty() {
                return Err(WorkflowError::conflict(format!(
                    "found previous frozen workflow on tablet {}, please review and delete it \
                     first before creating a new workflow",
                    target.primary.alias
                )));
            }
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// Check every target primary for time zone support
async fn check_time_zone_conversion(
    ctx: &EngineContext,
    targets: &[ShardPrimary],
    zone: &str,
) -> Result<()> {
    let query = format!(
        "select convert_tz({}, {}, 'UTC')",
        encode_string(&ctx.config.time_zone_sample),
        encode_string(zone)
    );
    ctx.for_all(targets, |target| {
        let query = query.as_str();
        async move {
            let result = ctx.execute_fetch_as_app(&target.primary, query, 1).await?;
            let value = result
                .rows
                .first()
                .and_then(|row| row.first())
                .and_then(Option::as_deref)
                .unwrap_or_default();
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map_err(|_| {
                WorkflowError::validation(format!(
                    "convert_tz() failed to convert time zone {} on tablet {}",
                    zone, target.primary.alias
                ))
            })?;
            Ok(())
        }
    })
    .await?;
    debug!(zone, "Time zone conversion supported on all targets");
    Ok(())
}

/// One insert template per target shard, in target shard order
fn generate_inserts(
    ctx: &EngineContext,
    spec: &WorkflowSpec,
    resolution: &Resolution,
) -> Result<Vec<StreamTemplate>> {
    let slot = key_range_slot(spec);
    let rules = build_rules(ctx.parser.as_ref(), spec, &resolution.target_vschema, &slot)?;
    let sub_type = if resolution.is_partial {
        WorkflowSubType::Partial
    } else {
        WorkflowSubType::None
    };

    let mut templates = Vec::with_capacity(resolution.target_shards.len());
    for target in &resolution.target_shards {
        let mut generator = InsertGenerator::new(&ctx.config).with_key_range_slot(&slot);
        for source in &resolution.source_shards {
            if spec.intent == MigrationIntent::MoveTables
                && !source.shard.key_range.intersects(&target.shard.key_range)
            {
                debug!(
                    source = %source.qualified_name(),
                    target = %target.qualified_name(),
                    "Skipping disjoint shard pair"
                );
                continue;
            }
            let binlog_source = BinlogSource {
                keyspace: spec.source_keyspace.clone(),
                shard: source.name().to_string(),
                filter: Filter {
                    rules: rules.clone(),
                },
                stop_after_copy: spec.stop_after_copy,
                external_cluster: spec.external_cluster.clone().unwrap_or_default(),
                source_time_zone: spec.source_time_zone.clone().unwrap_or_default(),
                target_time_zone: spec.target_time_zone.clone().unwrap_or_default(),
            };
            generator.add_row(
                &spec.workflow,
                &binlog_source,
                &spec.cell,
                &spec.tablet_types,
                spec.intent,
                sub_type,
            )?;
        }
        templates.push(generator.finish());
    }
    Ok(templates)
}

/// Flip every stream of `workflow` on `targets` to Running
pub(crate) async fn start_streams(
    ctx: &EngineContext,
    workflow: &str,
    targets: &[ShardPrimary],
) -> Result<()> {
    let statements = ControlStatements::new(&ctx.config);
    ctx.for_all(targets, |target| {
        let statements = &statements;
        async move {
            let query = statements.start_streams(&target.primary.db_name(), workflow);
            ctx.vreplication_exec(&target.primary, &query).await?;
            Ok(())
        }
    })
    .await?;
    ctx.metrics.workflows_started.increment(1);
    info!(workflow, shards = targets.len(), "Started workflow");
    Ok(())
}
