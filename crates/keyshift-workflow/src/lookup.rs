//! Lookup vindex provisioning
//!
//! A lookup vindex is backed by a table mapping the owner table's column
//! values to keyspace ids. Provisioning derives that backing table from the
//! owner's live schema, registers both VSchema changes and starts a
//! backfill workflow named after the backing table. The vindex stays
//! write-only until it is externalized.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::materializer::{create_workflow, validate_new_workflow, CreatedWorkflow};
use crate::resolver::shard_primaries;
use crate::settings::{CreateDdl, MigrationIntent, TableSettings, WorkflowSpec};
use crate::sql::{escape_id, quote_id};
use crate::tablet::TableDefinition;
use keyshift_topo::{
    vindex_for_column_type, ColumnVindex, KeyspaceVSchema, Table, Vindex, VindexKind,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Vindex parameter naming the backing table
pub const PARAM_TABLE: &str = "table";
/// Vindex parameter listing the owner columns, comma separated
pub const PARAM_FROM: &str = "from";
/// Vindex parameter naming the keyspace id column
pub const PARAM_TO: &str = "to";
/// Vindex parameter overriding the type of the `to` column
pub const PARAM_DATA_TYPE: &str = "data_type";
/// Vindex parameter marking a vindex that is written but not read
pub const PARAM_WRITE_ONLY: &str = "write_only";

const KEYSPACE_ID_COLUMN: &str = "keyspace_id";
const DEFAULT_TO_TYPE: &str = "varbinary(128)";

/// Request to create and backfill a lookup vindex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLookupVindexRequest {
    /// Keyspace of the owner table
    pub keyspace: String,
    /// Exactly one vindex and one table binding it
    pub spec: KeyspaceVSchema,
    #[serde(default)]
    pub cell: String,
    #[serde(default)]
    pub tablet_types: String,
    /// Keep streaming after the backfill even when the vindex has an owner
    #[serde(default)]
    pub continue_after_copy_with_owner: bool,
}

/// `keyspace.table` reference to a lookup backing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingTable {
    pub keyspace: String,
    pub table: String,
}

impl BackingTable {
    pub fn parse(vindex_name: &str, value: &str) -> Result<Self> {
        match value.split('.').collect::<Vec<_>>().as_slice() {
            [keyspace, table] if !keyspace.is_empty() && !table.is_empty() => Ok(Self {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
            }),
            _ => Err(WorkflowError::validation(format!(
                "vindex {} 'table' must be <keyspace>.<table>: {}",
                vindex_name, value
            ))),
        }
    }
}

/// Typed parameters of a lookup vindex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupParams {
    pub backing_table: BackingTable,
    pub from: Vec<String>,
    pub to: String,
    pub data_type: Option<String>,
    pub kind: VindexKind,
}

impl LookupParams {
    /// Validate and type the free-form parameters of `vindex`
    pub fn from_vindex(name: &str, vindex: &Vindex) -> Result<Self> {
        let kind = VindexKind::classify(&vindex.vindex_type);
        if !kind.is_lookup() {
            return Err(WorkflowError::validation(format!(
                "vindex {} is not a lookup type: {}",
                name, vindex.vindex_type
            )));
        }

        let backing_table = BackingTable::parse(
            name,
            vindex.params.get(PARAM_TABLE).map(String::as_str).unwrap_or_default(),
        )?;

        let from: Vec<String> = vindex
            .params
            .get(PARAM_FROM)
            .map(|v| {
                v.split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if kind.is_unique() && from.len() != 1 {
            return Err(WorkflowError::validation(format!(
                "unique vindex {} 'from' should have only one column: {:?}",
                name, from
            )));
        }
        if !kind.is_unique() && from.len() < 2 {
            return Err(WorkflowError::validation(format!(
                "non-unique vindex {} 'from' should have more than one column: {:?}",
                name, from
            )));
        }

        let to = vindex
            .params
            .get(PARAM_TO)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if to.is_empty() {
            return Err(WorkflowError::validation(format!(
                "vindex {} 'to' parameter must be specified",
                name
            )));
        }

        let data_type = vindex
            .params
            .get(PARAM_DATA_TYPE)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            backing_table,
            from,
            to,
            data_type,
            kind,
        })
    }

    /// Whether the backfill computes the keyspace id instead of copying `to`
    fn computes_keyspace_id(&self) -> bool {
        self.to.eq_ignore_ascii_case(KEYSPACE_ID_COLUMN) || self.kind.is_consistent_lookup()
    }
}

/// Everything derived from a validated request, before anything is saved
#[derive(Debug, Clone)]
pub(crate) struct LookupPlan {
    pub vindex_name: String,
    pub params: LookupParams,
    /// Owner keyspace document with the write-only vindex bound; includes the
    /// backing table when it lives in the same keyspace
    pub source_vschema: KeyspaceVSchema,
    /// Backing keyspace document with the backing table and its vindex
    pub target_vschema: KeyspaceVSchema,
    pub workflow: WorkflowSpec,
}

/// Validate the request and derive DDL, backfill query and VSchema changes
pub(crate) async fn prepare(
    ctx: &EngineContext,
    request: &CreateLookupVindexRequest,
) -> Result<LookupPlan> {
    let (vindex_name, vindex) = single_entry(&request.spec.vindexes, || {
        format!(
            "only one vindex must be specified in the specs: {:?}",
            request.spec.vindexes.keys().collect::<Vec<_>>()
        )
    })?;
    let params = LookupParams::from_vindex(vindex_name, vindex)?;
    let (owner_table, table_spec) = single_entry(&request.spec.tables, || {
        format!(
            "exactly one table must be specified in the specs: {:?}",
            request.spec.tables.keys().collect::<Vec<_>>()
        )
    })?;

    let [column_vindex] = table_spec.column_vindexes.as_slice() else {
        return Err(WorkflowError::validation(format!(
            "exactly one column vindex must be specified for table {}: {:?}",
            owner_table, table_spec.column_vindexes
        )));
    };
    if vindex.has_owner() && vindex.owner != *owner_table {
        return Err(WorkflowError::validation(format!(
            "vindex owner must match table name: {} vs {}",
            vindex.owner, owner_table
        )));
    }
    if column_vindex.name != *vindex_name {
        return Err(WorkflowError::validation(format!(
            "column vindex name must match vindex name: {} vs {}",
            column_vindex.name, vindex_name
        )));
    }
    let owner_columns = column_vindex.columns();
    if owner_columns.is_empty() {
        return Err(WorkflowError::validation(format!(
            "at least one column must be specified in the column vindex of table {}",
            owner_table
        )));
    }
    if owner_columns.len() != params.from.len() {
        return Err(WorkflowError::validation(format!(
            "length of table columns differs from length of vindex columns: {:?} vs {:?}",
            owner_columns, params.from
        )));
    }

    let mut source_vschema = ctx
        .topo_call(
            format!("GetVSchema({})", request.keyspace),
            ctx.topo.get_vschema(&request.keyspace),
        )
        .await?;
    let Some(source_table) = source_vschema.tables.get(owner_table.as_str()) else {
        return Err(WorkflowError::not_found(format!(
            "source table {} not found in vschema for keyspace {}",
            owner_table, request.keyspace
        )));
    };
    if source_table.column_vindexes.iter().any(|cv| {
        cv.name == *vindex_name && cv.columns().first() == owner_columns.first()
    }) {
        return Err(WorkflowError::conflict(format!(
            "column vindex {} for table {} already exists on column {}",
            vindex_name, owner_table, owner_columns[0]
        )));
    }

    let owner_definition = owner_definition(ctx, &request.keyspace, owner_table).await?;
    let create_ddl = backing_table_ddl(&owner_definition, owner_table, &owner_columns, &params)?;
    let query = backfill_query(owner_table, &owner_columns, &params, vindex.has_owner());

    // Backing table side
    let same_keyspace = params.backing_table.keyspace == request.keyspace;
    let mut target_vschema = if same_keyspace {
        source_vschema.clone()
    } else {
        ctx.topo_call(
            format!("GetVSchema({})", params.backing_table.keyspace),
            ctx.topo.get_vschema(&params.backing_table.keyspace),
        )
        .await?
    };
    let backing_table = if target_vschema.sharded {
        let column_type = owner_definition
            .field(&owner_columns[0])
            .map(|f| f.column_type.as_str())
            .unwrap_or_default();
        let vindex_type = vindex_for_column_type(column_type).ok_or_else(|| {
            WorkflowError::validation(format!(
                "type {} of column {} is not recommended for a vindex",
                column_type, owner_columns[0]
            ))
        })?;
        target_vschema.merge_vindex(vindex_type, Vindex::new(vindex_type))?;
        Table::default().with_column_vindex(ColumnVindex::single(&params.from[0], vindex_type))
    } else {
        Table::default()
    };
    target_vschema.merge_table(&params.backing_table.table, backing_table)?;

    // Owner side, layered on top of the backing table when both share a keyspace
    if same_keyspace {
        source_vschema = target_vschema.clone();
    }
    let mut write_only = vindex.clone();
    write_only
        .params
        .insert(PARAM_WRITE_ONLY.to_string(), "true".to_string());
    source_vschema.merge_vindex(vindex_name, write_only)?;
    if let Some(table) = source_vschema.tables.get_mut(owner_table.as_str()) {
        table.column_vindexes.push(column_vindex.clone());
    }

    let workflow = WorkflowSpec::builder(
        format!(
            "{}{}",
            params.backing_table.table, ctx.config.lookup_workflow_suffix
        ),
        &request.keyspace,
        &params.backing_table.keyspace,
    )
    .intent(MigrationIntent::CreateLookupIndex)
    .cell(&request.cell)
    .tablet_types(&request.tablet_types)
    .stop_after_copy(vindex.has_owner() && !request.continue_after_copy_with_owner)
    .table(
        TableSettings::new(&params.backing_table.table)
            .with_source_expression(query)
            .with_create_ddl(CreateDdl::Literal(create_ddl)),
    )
    .build()?;

    Ok(LookupPlan {
        vindex_name: vindex_name.clone(),
        params,
        source_vschema,
        target_vschema,
        workflow,
    })
}

/// Provision the vindex and start its backfill
pub(crate) async fn create_lookup_vindex(
    ctx: &EngineContext,
    request: &CreateLookupVindexRequest,
) -> Result<CreatedWorkflow> {
    let plan = prepare(ctx, request).await?;
    let target_keyspace = &plan.params.backing_table.keyspace;
    validate_new_workflow(ctx, target_keyspace, &plan.workflow.workflow).await?;

    ctx.topo_call(
        format!("SaveVSchema({})", target_keyspace),
        ctx.topo.save_vschema(target_keyspace, &plan.target_vschema),
    )
    .await?;

    let created = create_workflow(ctx, &plan.workflow).await?;

    ctx.topo_call(
        format!("SaveVSchema({})", request.keyspace),
        ctx.topo.save_vschema(&request.keyspace, &plan.source_vschema),
    )
    .await?;
    ctx.topo_call("RebuildVSchemaGraph", ctx.topo.rebuild_serving_vschema())
        .await?;

    info!(
        vindex = %plan.vindex_name,
        keyspace = %request.keyspace,
        backing_table = %format!("{}.{}", target_keyspace, plan.params.backing_table.table),
        workflow = %plan.workflow.workflow,
        "Created lookup vindex"
    );
    Ok(created)
}

fn single_entry<'a, V>(
    map: &'a std::collections::BTreeMap<String, V>,
    message: impl FnOnce() -> String,
) -> Result<(&'a String, &'a V)> {
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err(WorkflowError::validation(message())),
    }
}

/// Live definition of the owner table from the first source shard
async fn owner_definition(
    ctx: &EngineContext,
    keyspace: &str,
    table: &str,
) -> Result<TableDefinition> {
    let shards = shard_primaries(ctx, &ctx.topo, keyspace, &[]).await?;
    let mut schema = ctx
        .get_schema(&shards[0].primary, &[table.to_string()], &[])
        .await?;
    if schema.table_definitions.len() != 1 {
        return Err(WorkflowError::not_found(format!(
            "unexpected number of tables ({}) returned from schema of {}",
            schema.table_definitions.len(),
            table
        )));
    }
    Ok(schema.table_definitions.remove(0))
}

/// `CREATE TABLE` of the backing table, derived from the owner's DDL text
///
/// The owner columns are renamed in place to the `from` names with their
/// `AUTO_INCREMENT` and `DEFAULT NULL` modifiers removed, then the `to`
/// column and a primary key over the `from` columns are appended.
pub(crate) fn backing_table_ddl(
    owner: &TableDefinition,
    owner_table: &str,
    owner_columns: &[String],
    params: &LookupParams,
) -> Result<String> {
    let lines: Vec<&str> = owner.schema.lines().collect();
    if lines.len() < 3 {
        return Err(WorkflowError::validation(format!(
            "schema looks incorrect: {}, expecting at least three lines",
            owner.schema
        )));
    }

    let mut modified = Vec::with_capacity(owner_columns.len() + 3);
    modified.push(lines[0].replacen(owner_table, &params.backing_table.table, 1));
    for (column, from) in owner_columns.iter().zip(&params.from) {
        let quoted = quote_id(column);
        let line = lines[1..]
            .iter()
            .find(|line| line.contains(&quoted))
            .ok_or_else(|| {
                WorkflowError::not_found(format!(
                    "column {} not found in schema {}",
                    column, owner.schema
                ))
            })?;
        modified.push(
            line.replacen(&quoted, &quote_id(from), 1)
                .replacen(" AUTO_INCREMENT", "", 1)
                .replacen(" DEFAULT NULL", "", 1),
        );
    }

    let to_type = match &params.data_type {
        Some(data_type) if !params.kind.is_consistent_lookup() => data_type.as_str(),
        _ => DEFAULT_TO_TYPE,
    };
    modified.push(format!("  {} {},", quote_id(&params.to), to_type));

    let primary_key: Vec<String> = params.from.iter().map(|c| quote_id(c)).collect();
    modified.push(format!("  PRIMARY KEY ({})", primary_key.join(", ")));
    modified.push(")".to_string());
    Ok(modified.join("\n"))
}

/// Select that backfills the backing table from the owner table
pub(crate) fn backfill_query(
    owner_table: &str,
    owner_columns: &[String],
    params: &LookupParams,
    owned: bool,
) -> String {
    let mut projection: Vec<String> = owner_columns
        .iter()
        .zip(&params.from)
        .map(|(column, from)| format!("{} as {}", escape_id(column), escape_id(from)))
        .collect();
    let to = escape_id(&params.to);
    if params.computes_keyspace_id() {
        projection.push(format!("keyspace_id() as {}", to));
    } else {
        projection.push(to.to_string());
    }

    let mut query = format!(
        "select {} from {}",
        projection.join(", "),
        escape_id(owner_table)
    );
    if owned {
        let mut group_by: Vec<String> = params
            .from
            .iter()
            .map(|c| escape_id(c).into_owned())
            .collect();
        group_by.push(to.into_owned());
        query.push_str(" group by ");
        query.push_str(&group_by.join(", "));
    }
    query
}
