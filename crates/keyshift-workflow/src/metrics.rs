//! Workflow engine metrics

/// Counters emitted by the workflow engine
#[derive(Clone)]
pub struct WorkflowMetrics {
    /// Stream records inserted into target shards
    pub streams_created: metrics::Counter,
    /// Workflows flipped to Running
    pub workflows_started: metrics::Counter,
    /// Per-shard failures collected during fan-out
    pub shard_failures: metrics::Counter,
    /// Schema change batches applied to target shards
    pub schema_batches_applied: metrics::Counter,
    /// Lookup vindexes made readable
    pub vindexes_externalized: metrics::Counter,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self {
            streams_created: metrics::counter!("keyshift_workflow_streams_created_total"),
            workflows_started: metrics::counter!("keyshift_workflow_workflows_started_total"),
            shard_failures: metrics::counter!("keyshift_workflow_shard_failures_total"),
            schema_batches_applied: metrics::counter!(
                "keyshift_workflow_schema_batches_applied_total"
            ),
            vindexes_externalized: metrics::counter!(
                "keyshift_workflow_vindexes_externalized_total"
            ),
        }
    }
}

impl Default for WorkflowMetrics {
    fn default() -> Self {
        Self::new()
    }
}
