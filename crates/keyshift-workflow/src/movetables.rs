//! MoveTables
//!
//! Moves whole tables from one keyspace to another. Before any stream is
//! created, routing rules pin every name the tables can be addressed by to
//! the source keyspace, so traffic keeps flowing there until it is switched
//! explicitly.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::materializer::{create_workflow, validate_new_workflow, CreatedWorkflow};
use crate::resolver::{shard_primaries, source_store};
use crate::settings::{CreateDdl, MigrationIntent, TableSettings, WorkflowSpec};
use crate::sql::escape_id;
use keyshift_topo::{KeyspaceVSchema, RoutingRules, Table, TopologyStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

/// Tables created by online DDL and table lifecycle management
static INTERNAL_TABLE_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^(_vt_(HOLD|PURGE|EVAC|DROP)_[0-9a-f]{32}_20[0-9]{12}|_vt_(hld|prg|evc|drp|vrp|gho|ghc|olo)_[0-9a-f]{32}_20[0-9]{12}_|_[0-9a-f]{8}_[0-9a-f]{4}_[0-9a-f]{4}_[0-9a-f]{4}_[0-9a-f]{12}_20[0-9]{12}_(gho|ghc|del|new|vrepl))",
    )
    .expect("internal table regex pattern is invalid - this is a bug")
});

/// Whether `table` is an internal online-DDL or lifecycle table
pub fn is_internal_table(table: &str) -> bool {
    INTERNAL_TABLE_REGEX.is_match(table)
}

/// Which tables to move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSelection {
    /// Every table of the source keyspace, minus the excludes
    All,
    Named(Vec<String>),
    /// Table definitions merged into the target VSchema as given
    VSchema(BTreeMap<String, Table>),
}

impl TableSelection {
    /// Parse a comma separated table list or a JSON VSchema document
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.starts_with('{') {
            let vschema: KeyspaceVSchema = serde_json::from_str(value)?;
            return Ok(Self::VSchema(vschema.tables));
        }
        Ok(Self::Named(
            value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

/// Request to move tables between keyspaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTablesRequest {
    pub workflow: String,
    pub source_keyspace: String,
    pub target_keyspace: String,
    pub tables: TableSelection,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    #[serde(default)]
    pub cell: String,
    #[serde(default)]
    pub tablet_types: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub stop_after_copy: bool,
    #[serde(default)]
    pub external_cluster: Option<String>,
    #[serde(default)]
    pub drop_foreign_keys: bool,
    #[serde(default)]
    pub source_time_zone: Option<String>,
    #[serde(default)]
    pub source_shards: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl MoveTablesRequest {
    pub fn new(
        workflow: impl Into<String>,
        source_keyspace: impl Into<String>,
        target_keyspace: impl Into<String>,
        tables: TableSelection,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            source_keyspace: source_keyspace.into(),
            target_keyspace: target_keyspace.into(),
            tables,
            exclude_tables: Vec::new(),
            cell: String::new(),
            tablet_types: String::new(),
            auto_start: true,
            stop_after_copy: false,
            external_cluster: None,
            drop_foreign_keys: false,
            source_time_zone: None,
            source_shards: Vec::new(),
        }
    }

    fn is_external(&self) -> bool {
        self.external_cluster.is_some()
    }
}

/// Set up routing and VSchema for the moved tables and create the workflow
pub(crate) async fn move_tables(
    ctx: &EngineContext,
    request: &MoveTablesRequest,
) -> Result<CreatedWorkflow> {
    // Name conflicts must surface before routing rules or VSchema change
    validate_new_workflow(ctx, &request.target_keyspace, &request.workflow).await?;
    let source_topo = source_store(ctx, request.external_cluster.as_deref()).await?;
    let tables = select_tables(ctx, &source_topo, request).await?;
    debug!(workflow = %request.workflow, tables = ?tables, "Tables to move");

    let mut target_vschema = ctx
        .topo_call(
            format!("GetVSchema({})", request.target_keyspace),
            ctx.topo.get_vschema(&request.target_keyspace),
        )
        .await?;
    match &request.tables {
        TableSelection::VSchema(definitions) => {
            for (name, table) in definitions {
                target_vschema.merge_table(name, table.clone())?;
            }
        }
        _ if !target_vschema.sharded => {
            let source_vschema = if request.is_external() {
                None
            } else {
                Some(
                    ctx.topo_call(
                        format!("GetVSchema({})", request.source_keyspace),
                        ctx.topo.get_vschema(&request.source_keyspace),
                    )
                    .await?,
                )
            };
            for table in &tables {
                if target_vschema.tables.contains_key(table) {
                    continue;
                }
                let auto_increment = source_vschema
                    .as_ref()
                    .and_then(|vs| vs.tables.get(table))
                    .and_then(|t| t.auto_increment.clone());
                target_vschema.tables.insert(
                    table.clone(),
                    Table {
                        auto_increment,
                        ..Default::default()
                    },
                );
            }
        }
        _ => {}
    }

    if !request.is_external() {
        let mut rules = ctx
            .topo_call("GetRoutingRules", ctx.topo.get_routing_rules())
            .await?;
        add_routing_rules(
            &mut rules,
            &request.source_keyspace,
            &request.target_keyspace,
            &tables,
        )?;
        ctx.topo_call("SaveRoutingRules", ctx.topo.save_routing_rules(&rules))
            .await?;
    }

    ctx.topo_call(
        format!("SaveVSchema({})", request.target_keyspace),
        ctx.topo.save_vschema(&request.target_keyspace, &target_vschema),
    )
    .await?;
    ctx.topo_call("RebuildVSchemaGraph", ctx.topo.rebuild_serving_vschema())
        .await?;

    let create_ddl = if request.drop_foreign_keys {
        CreateDdl::CopyDropForeignKeys
    } else {
        CreateDdl::Copy
    };
    let mut builder = WorkflowSpec::builder(
        &request.workflow,
        &request.source_keyspace,
        &request.target_keyspace,
    )
    .intent(MigrationIntent::MoveTables)
    .cell(&request.cell)
    .tablet_types(&request.tablet_types)
    .stop_after_copy(request.stop_after_copy)
    .auto_start(request.auto_start)
    .source_shards(request.source_shards.iter().cloned());
    if let Some(cluster) = &request.external_cluster {
        builder = builder.external_cluster(cluster);
    }
    if let Some(zone) = &request.source_time_zone {
        builder = builder.time_zones(zone, &ctx.config.default_target_time_zone);
    }
    for table in &tables {
        builder = builder.table(
            TableSettings::new(table)
                .with_source_expression(format!("select * from {}", escape_id(table)))
                .with_create_ddl(create_ddl.clone()),
        );
    }
    let spec = builder.build()?;

    let created = create_workflow(ctx, &spec).await?;
    info!(
        workflow = %request.workflow,
        source = %request.source_keyspace,
        target = %request.target_keyspace,
        tables = tables.len(),
        "MoveTables workflow created"
    );
    Ok(created)
}

/// Resolve the request's table selection against the source schema
async fn select_tables(
    ctx: &EngineContext,
    source_topo: &Arc<dyn TopologyStore>,
    request: &MoveTablesRequest,
) -> Result<Vec<String>> {
    if let TableSelection::VSchema(definitions) = &request.tables {
        return Ok(definitions.keys().cloned().collect());
    }

    let shards = shard_primaries(ctx, source_topo, &request.source_keyspace, &[]).await?;
    let schema = ctx.get_schema(&shards[0].primary, &[], &[]).await?;
    let source_tables: Vec<String> = schema
        .table_names()
        .into_iter()
        .filter(|t| !is_internal_table(t))
        .collect();

    let named: &[String] = match &request.tables {
        TableSelection::Named(names) => names,
        _ => &[],
    };
    let missing: Vec<&str> = request
        .exclude_tables
        .iter()
        .chain(named)
        .filter(|t| !is_internal_table(t) && !source_tables.contains(*t))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(WorkflowError::validation(format!(
            "table(s) not found in source keyspace {}: {}",
            request.source_keyspace,
            missing.join(",")
        )));
    }

    let selected: Vec<String> = match &request.tables {
        TableSelection::Named(_) => named
            .iter()
            .filter(|t| !is_internal_table(t))
            .cloned()
            .collect(),
        _ => source_tables,
    };
    let tables: Vec<String> = selected
        .into_iter()
        .filter(|t| !request.exclude_tables.contains(t))
        .collect();
    if tables.is_empty() {
        return Err(WorkflowError::validation(format!(
            "no tables to move from keyspace {}",
            request.source_keyspace
        )));
    }
    Ok(tables)
}

/// Route every name of each table to the source keyspace
pub(crate) fn add_routing_rules(
    rules: &mut RoutingRules,
    source_keyspace: &str,
    target_keyspace: &str,
    tables: &[String],
) -> Result<()> {
    for table in tables {
        let to_source = vec![format!("{}.{}", source_keyspace, table)];
        let mut names = Vec::with_capacity(8);
        for prefix in [String::new(), format!("{}.", target_keyspace)] {
            for suffix in ["", "@replica", "@rdonly"] {
                names.push(format!("{}{}{}", prefix, table, suffix));
            }
        }
        for suffix in ["@replica", "@rdonly"] {
            names.push(format!("{}.{}{}", source_keyspace, table, suffix));
        }
        for name in names {
            rules.merge(&name, to_source.clone())?;
        }
    }
    Ok(())
}
