//! Shared engine dependencies and deadline-bounded outbound calls

use crate::config::EngineConfig;
use crate::error::{AggregateError, Result, WorkflowError};
use crate::metrics::WorkflowMetrics;
use crate::sql::SqlParser;
use crate::tablet::{QueryResult, SchemaChange, SchemaDefinition, TabletManagerClient};
use futures::future::join_all;
use keyshift_topo::{Tablet, TopoResult, TopologyStore};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dependencies shared by every workflow operation
pub(crate) struct EngineContext {
    pub topo: Arc<dyn TopologyStore>,
    pub tmc: Arc<dyn TabletManagerClient>,
    pub parser: Arc<dyn SqlParser>,
    pub config: EngineConfig,
    pub metrics: WorkflowMetrics,
}

impl EngineContext {
    /// Run `future` under the configured RPC deadline
    pub async fn deadline<T, F>(&self, operation: impl Into<String>, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.rpc_timeout(), future).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Timeout {
                operation: operation.into(),
                timeout_ms: self.config.rpc_timeout_ms,
            }),
        }
    }

    /// Run a topology call under the configured RPC deadline
    pub async fn topo_call<T, F>(&self, operation: impl Into<String>, future: F) -> Result<T>
    where
        F: Future<Output = TopoResult<T>>,
    {
        self.deadline(operation, async move { future.await.map_err(WorkflowError::from) })
            .await
    }

    // ==================== Tablet RPCs ====================

    pub async fn get_schema(
        &self,
        tablet: &Tablet,
        tables: &[String],
        exclude_tables: &[String],
    ) -> Result<SchemaDefinition> {
        self.deadline(
            format!("GetSchema({})", tablet.alias),
            self.tmc.get_schema(tablet, tables, exclude_tables),
        )
        .await
    }

    pub async fn apply_schema(&self, tablet: &Tablet, change: &SchemaChange) -> Result<()> {
        self.deadline(
            format!("ApplySchema({})", tablet.alias),
            self.tmc.apply_schema(tablet, change),
        )
        .await
    }

    pub async fn vreplication_exec(&self, tablet: &Tablet, query: &str) -> Result<QueryResult> {
        debug!(tablet = %tablet.alias, query, "VReplicationExec");
        self.deadline(
            format!("VReplicationExec({})", tablet.alias),
            self.tmc.vreplication_exec(tablet, query),
        )
        .await
    }

    pub async fn execute_fetch_as_app(
        &self,
        tablet: &Tablet,
        query: &str,
        max_rows: usize,
    ) -> Result<QueryResult> {
        self.deadline(
            format!("ExecuteFetchAsApp({})", tablet.alias),
            self.tmc.execute_fetch_as_app(tablet, query, max_rows),
        )
        .await
    }

    // ==================== Fan-out ====================

    /// Run `task` for every item concurrently and wait for all of them
    ///
    /// Every failure is collected; the merged error is returned only after
    /// the last task finished. Side effects of successful tasks stay in place.
    pub async fn for_all<'a, T, R, F, Fut>(&self, items: &'a [T], task: F) -> Result<Vec<R>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let recorder = ErrorRecorder::default();
        let results = join_all(items.iter().map(|item| {
            let future = task(item);
            let recorder = &recorder;
            async move {
                match future.await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        recorder.record(e);
                        None
                    }
                }
            }
        }))
        .await;

        let failures = recorder.len();
        if failures > 0 {
            self.metrics.shard_failures.increment(failures as u64);
            warn!(failures, total = items.len(), "Fan-out phase failed");
        }
        recorder.finish()?;
        Ok(results.into_iter().flatten().collect())
    }
}

/// Thread-safe collector of per-shard errors
#[derive(Default)]
pub(crate) struct ErrorRecorder {
    errors: Mutex<Vec<WorkflowError>>,
}

impl ErrorRecorder {
    pub fn record(&self, error: WorkflowError) {
        self.errors.lock().push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn finish(self) -> Result<()> {
        match AggregateError::merge(self.errors.into_inner()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
