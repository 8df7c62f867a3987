//! Target schema deployment
//!
//! Creates missing target tables on every target shard. Existing tables are
//! never altered. Copy policies read the source DDL once per workflow from
//! the first source shard's primary, no matter how many target shards race
//! for it.

use crate::context::EngineContext;
use crate::error::{Result, WorkflowError};
use crate::resolver::{Resolution, ShardPrimary};
use crate::settings::{CreateDdl, TableSettings, WorkflowSpec};
use crate::sql::ConstraintStrip;
use crate::tablet::SchemaChange;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub(crate) struct SchemaDeployer<'a> {
    ctx: &'a EngineContext,
    spec: &'a WorkflowSpec,
    resolution: &'a Resolution,
    source_ddls: OnceCell<HashMap<String, String>>,
}

impl<'a> SchemaDeployer<'a> {
    pub fn new(ctx: &'a EngineContext, spec: &'a WorkflowSpec, resolution: &'a Resolution) -> Self {
        Self {
            ctx,
            spec,
            resolution,
            source_ddls: OnceCell::new(),
        }
    }

    /// Create missing tables on every target shard
    pub async fn deploy(&self) -> Result<()> {
        self.ctx
            .for_all(&self.resolution.target_shards, |target| self.deploy_shard(target))
            .await?;
        Ok(())
    }

    async fn deploy_shard(&self, target: &ShardPrimary) -> Result<()> {
        let tables: Vec<String> = self
            .spec
            .table_settings
            .iter()
            .map(|ts| ts.target_table.clone())
            .collect();
        let existing = self
            .ctx
            .get_schema(&target.primary, &tables, &[])
            .await?;

        let mut statements = Vec::new();
        for ts in &self.spec.table_settings {
            if existing.table(&ts.target_table).is_some() {
                continue;
            }
            statements.push(self.create_statement(ts).await?);
        }
        if statements.is_empty() {
            debug!(shard = %target.qualified_name(), "Target schema already in place");
            return Ok(());
        }

        let change = SchemaChange {
            sql: statements.join(";\n"),
            force: false,
            allow_replication: true,
            sql_mode: self.ctx.config.sql_mode.clone(),
        };
        self.ctx.apply_schema(&target.primary, &change).await?;
        self.ctx.metrics.schema_batches_applied.increment(1);
        info!(
            shard = %target.qualified_name(),
            tables = statements.len(),
            "Created target tables"
        );
        Ok(())
    }

    async fn create_statement(&self, ts: &TableSettings) -> Result<String> {
        let strip = match &ts.create_ddl {
            CreateDdl::None => {
                return Err(WorkflowError::not_found(format!(
                    "target table {} does not exist and there is no create ddl defined",
                    ts.target_table
                )))
            }
            CreateDdl::Literal(ddl) => return Ok(ddl.clone()),
            CreateDdl::Copy => None,
            CreateDdl::CopyDropConstraints => Some(ConstraintStrip::All),
            CreateDdl::CopyDropForeignKeys => Some(ConstraintStrip::ForeignKeys),
        };

        if !ts.source_expression.is_empty() {
            let source_table = self.ctx.parser.table_name(&ts.source_expression)?;
            if source_table != ts.target_table {
                return Err(WorkflowError::validation(format!(
                    "source and target table names must match for copying schema: {} vs {}",
                    source_table, ts.target_table
                )));
            }
        }

        let ddl = self
            .source_ddls()
            .await?
            .get(&ts.target_table)
            .ok_or_else(|| {
                WorkflowError::not_found(format!(
                    "source table {} does not exist",
                    ts.target_table
                ))
            })?;
        match strip {
            Some(mode) => self.ctx.parser.strip_constraints(ddl, mode),
            None => Ok(ddl.clone()),
        }
    }

    /// Source DDL by table name, fetched on first use
    async fn source_ddls(&self) -> Result<&HashMap<String, String>> {
        self.source_ddls
            .get_or_try_init(|| async {
                let source = self.resolution.first_source();
                let schema = self.ctx.get_schema(&source.primary, &[], &[]).await?;
                debug!(
                    shard = %source.qualified_name(),
                    tables = schema.table_definitions.len(),
                    "Fetched source schema"
                );
                Ok::<_, WorkflowError>(
                    schema
                        .table_definitions
                        .into_iter()
                        .map(|t| (t.name, t.schema))
                        .collect(),
                )
            })
            .await
    }
}
