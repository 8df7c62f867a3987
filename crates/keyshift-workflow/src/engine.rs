//! Public workflow engine

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::Result;
use crate::externalize::{externalize_vindex, ExternalizedVindex};
use crate::lookup::{create_lookup_vindex, CreateLookupVindexRequest};
use crate::materializer::{create_workflow, start_streams, CreatedWorkflow};
use crate::metrics::WorkflowMetrics;
use crate::movetables::{move_tables, MoveTablesRequest};
use crate::resolver::shard_primaries;
use crate::settings::{MigrationIntent, WorkflowSpec};
use crate::sql::{MySqlParser, SqlParser};
use crate::stream::{ControlStatements, StreamRecord};
use crate::tablet::TabletManagerClient;
use keyshift_topo::TopologyStore;
use std::sync::Arc;
use tracing::instrument;

/// Cross-shard migration workflow engine
///
/// Every operation fans out over the shards involved, waits for all of them
/// and reports every per-shard failure. Work already done on shards that
/// succeeded is not rolled back.
///
/// Two operations must not run concurrently against the same keyspace pair;
/// VSchema documents are read, modified and saved without a lock.
pub struct WorkflowEngine {
    ctx: EngineContext,
}

impl WorkflowEngine {
    /// Create an engine with the default configuration and MySQL parser
    pub fn new(topo: Arc<dyn TopologyStore>, tmc: Arc<dyn TabletManagerClient>) -> Self {
        Self {
            ctx: EngineContext {
                topo,
                tmc,
                parser: Arc::new(MySqlParser::new()),
                config: EngineConfig::default(),
                metrics: WorkflowMetrics::new(),
            },
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.ctx.config = config;
        self
    }

    /// Replace the SQL capability
    pub fn with_parser(mut self, parser: Arc<dyn SqlParser>) -> Self {
        self.ctx.parser = parser;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Move tables to another keyspace, pinning routing to the source
    #[instrument(skip(self, request), fields(workflow = %request.workflow))]
    pub async fn move_tables(&self, request: &MoveTablesRequest) -> Result<CreatedWorkflow> {
        move_tables(&self.ctx, request).await
    }

    /// Create the streams of an arbitrary workflow
    #[instrument(skip(self, spec), fields(workflow = %spec.workflow))]
    pub async fn materialize(&self, spec: &WorkflowSpec) -> Result<CreatedWorkflow> {
        let mut spec = spec.clone();
        spec.intent = MigrationIntent::Materialize;
        create_workflow(&self.ctx, &spec).await
    }

    /// Provision a lookup vindex and start its backfill
    #[instrument(skip(self, request), fields(keyspace = %request.keyspace))]
    pub async fn create_lookup_vindex(
        &self,
        request: &CreateLookupVindexRequest,
    ) -> Result<CreatedWorkflow> {
        create_lookup_vindex(&self.ctx, request).await
    }

    /// Make a backfilled lookup vindex readable; `vindex` is `keyspace.name`
    #[instrument(skip(self))]
    pub async fn externalize_vindex(&self, vindex: &str) -> Result<ExternalizedVindex> {
        externalize_vindex(&self.ctx, vindex).await
    }

    /// Start every stream of `workflow` in `keyspace`
    #[instrument(skip(self))]
    pub async fn start_workflow(&self, keyspace: &str, workflow: &str) -> Result<()> {
        let targets = shard_primaries(&self.ctx, &self.ctx.topo, keyspace, &[]).await?;
        start_streams(&self.ctx, workflow, &targets).await
    }

    /// Every stream of `workflow` in `keyspace`, shard by shard
    #[instrument(skip(self))]
    pub async fn workflow_streams(
        &self,
        keyspace: &str,
        workflow: &str,
    ) -> Result<Vec<StreamRecord>> {
        let ctx = &self.ctx;
        let targets = shard_primaries(ctx, &ctx.topo, keyspace, &[]).await?;
        let statements = ControlStatements::new(&ctx.config);
        let per_shard = ctx
            .for_all(&targets, |target| {
                let statements = &statements;
                async move {
                    let query = statements.select_streams(&target.primary.db_name(), workflow);
                    let result = ctx.vreplication_exec(&target.primary, &query).await?;
                    StreamRecord::from_rows(workflow, target.name(), &result)
                }
            })
            .await?;
        Ok(per_shard.into_iter().flatten().collect())
    }
}
