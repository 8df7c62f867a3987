//! Stream records and replication control statements
//!
//! Every stream is one row in `<control db>.vreplication` on a target
//! primary. The source descriptor column holds a JSON [`BinlogSource`]
//! telling the replication runtime which source shard to tail and which
//! filter rules to apply.
//!
//! Insert statements are generated once per target shard as a
//! [`StreamTemplate`] with two open slots, the target key range and the
//! target database name, which are filled in right before execution.

use crate::config::EngineConfig;
use crate::error::{Result, WorkflowError};
use crate::settings::{MigrationIntent, WorkflowSpec};
use crate::sql::encode_string;
use crate::tablet::QueryResult;
use keyshift_topo::KeyRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder for the target shard's key range inside filter queries
pub const KEYRANGE_PLACEHOLDER: &str = "{{keyrange}}";

/// Message the replication runtime leaves on streams that finished copying
pub const STOPPED_AFTER_COPY: &str = "Stopped after copy";

/// Message on streams of a completed, frozen workflow
pub const FROZEN: &str = "FROZEN";

// ==================== Source Descriptor ====================

/// One table rule of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Target table the rule feeds
    #[serde(rename = "match")]
    pub match_table: String,
    /// Select run against the source; empty replicates the table as-is
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Source descriptor persisted with every stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogSource {
    pub keyspace: String,
    pub shard: String,
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stop_after_copy: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_time_zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_time_zone: String,
}

// ==================== Stream State ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Stopped,
    Running,
    Error,
}

impl StreamState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Running => "Running",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamState {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Stopped" => Ok(Self::Stopped),
            "Running" => Ok(Self::Running),
            "Error" => Ok(Self::Error),
            other => Err(WorkflowError::Serialization(format!(
                "unknown stream state: {}",
                other
            ))),
        }
    }
}

/// Whether a workflow covers the whole keyspace or only some shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowSubType {
    #[default]
    None,
    Partial,
}

impl WorkflowSubType {
    pub const fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Partial => 1,
        }
    }
}

/// A persisted stream as read back from a target primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: i64,
    pub workflow: String,
    /// Target shard holding the record
    pub shard: String,
    pub state: StreamState,
    pub message: String,
    pub source: BinlogSource,
}

impl StreamRecord {
    /// Decode the rows of a [`ControlStatements::select_streams`] result
    pub fn from_rows(workflow: &str, shard: &str, result: &QueryResult) -> Result<Vec<Self>> {
        (0..result.rows.len())
            .map(|row| {
                let id = result
                    .value(row, "id")
                    .and_then(|v| v.parse::<i64>().ok())
                    .ok_or_else(|| {
                        WorkflowError::Serialization(format!("stream on {} has no valid id", shard))
                    })?;
                let state = result.value(row, "state").unwrap_or_default().parse()?;
                let source = serde_json::from_str(result.value(row, "source").unwrap_or("{}"))?;
                Ok(Self {
                    id,
                    workflow: workflow.to_string(),
                    shard: shard.to_string(),
                    state,
                    message: result.value(row, "message").unwrap_or_default().to_string(),
                    source,
                })
            })
            .collect()
    }
}

// ==================== Insert Generation ====================

/// Key range placeholder that occurs in none of the values of `spec`
///
/// Usually [`KEYRANGE_PLACEHOLDER`]; a numbered variant is picked when a
/// source expression or name already contains it.
pub fn key_range_slot(spec: &WorkflowSpec) -> String {
    let mut texts = vec![
        spec.workflow.as_str(),
        spec.source_keyspace.as_str(),
        spec.cell.as_str(),
        spec.tablet_types.as_str(),
    ];
    texts.extend(spec.external_cluster.as_deref());
    texts.extend(spec.source_time_zone.as_deref());
    texts.extend(spec.target_time_zone.as_deref());
    for ts in &spec.table_settings {
        texts.push(ts.target_table.as_str());
        texts.push(ts.source_expression.as_str());
    }

    let mut slot = KEYRANGE_PLACEHOLDER.to_string();
    let mut suffix = 0;
    while texts.iter().any(|text| text.contains(&slot)) {
        suffix += 1;
        slot = format!("{{{{keyrange_{}}}}}", suffix);
    }
    slot
}

/// Insert rows with the key range and database name still unresolved
///
/// The database name is never part of the row text, and only the key range
/// slot chosen by the generator is substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTemplate {
    header: String,
    key_range_slot: String,
    /// Row text before and after the database name column
    rows: Vec<(String, String)>,
}

impl StreamTemplate {
    /// Number of streams the insert creates
    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert for one target shard; empty when there are no rows
    pub fn render(&self, key_range: &KeyRange, db_name: &str) -> String {
        if self.rows.is_empty() {
            return String::new();
        }
        let key_range = key_range.to_string();
        let db_name = encode_string(db_name);
        let values: Vec<String> = self
            .rows
            .iter()
            .map(|(head, tail)| {
                format!(
                    "({}{}{})",
                    head.replace(&self.key_range_slot, &key_range),
                    db_name,
                    tail
                )
            })
            .collect();
        format!("{} values {}", self.header, values.join(", "))
    }
}

/// Accumulates stream rows into one multi-row insert
pub struct InsertGenerator<'a> {
    config: &'a EngineConfig,
    now: i64,
    key_range_slot: String,
    rows: Vec<(String, String)>,
}

impl<'a> InsertGenerator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            now: chrono::Utc::now().timestamp(),
            key_range_slot: KEYRANGE_PLACEHOLDER.to_string(),
            rows: Vec::new(),
        }
    }

    /// Key range placeholder the filter rules were built with
    pub fn with_key_range_slot(mut self, slot: impl Into<String>) -> Self {
        self.key_range_slot = slot.into();
        self
    }

    /// Add one stream in state Stopped
    #[allow(clippy::too_many_arguments)]
    pub fn add_row(
        &mut self,
        workflow: &str,
        source: &BinlogSource,
        cell: &str,
        tablet_types: &str,
        intent: MigrationIntent,
        sub_type: WorkflowSubType,
    ) -> Result<()> {
        let source = serde_json::to_string(source)?;
        let head = format!(
            "{}, {}, {}, {}, {}, {}, {}, {}, 0, {}, ",
            encode_string(workflow),
            encode_string(&source),
            encode_string(""),
            self.config.max_stream_tps,
            self.config.max_replication_lag,
            encode_string(cell),
            encode_string(tablet_types),
            self.now,
            encode_string(StreamState::Stopped.as_str()),
        );
        let tail = format!(", {}, {}", intent.code(), sub_type.code());
        self.rows.push((head, tail));
        Ok(())
    }

    pub fn finish(self) -> StreamTemplate {
        StreamTemplate {
            header: format!(
                "insert into {} (workflow, source, pos, max_tps, max_replication_lag, cell, \
                 tablet_types, time_updated, transaction_timestamp, state, db_name, \
                 workflow_type, workflow_sub_type)",
                self.config.vreplication_table()
            ),
            key_range_slot: self.key_range_slot,
            rows: self.rows,
        }
    }
}

// ==================== Control Statements ====================

/// Statements against the replication control tables
pub struct ControlStatements<'a> {
    config: &'a EngineConfig,
}

impl<'a> ControlStatements<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Streams of a workflow, one row each
    pub fn workflow_exists(&self, db_name: &str, workflow: &str) -> String {
        format!(
            "select 1 from {} where db_name={} and workflow={}",
            self.config.vreplication_table(),
            encode_string(db_name),
            encode_string(workflow)
        )
    }

    /// Frozen streams of non-partial workflows
    pub fn frozen_workflows(&self, db_name: &str) -> String {
        format!(
            "select 1 from {} where db_name={} and message={} and workflow_sub_type != {}",
            self.config.vreplication_table(),
            encode_string(db_name),
            encode_string(FROZEN),
            WorkflowSubType::Partial.code()
        )
    }

    pub fn select_streams(&self, db_name: &str, workflow: &str) -> String {
        format!(
            "select id, state, message, source from {} where db_name={} and workflow={}",
            self.config.vreplication_table(),
            encode_string(db_name),
            encode_string(workflow)
        )
    }

    pub fn start_streams(&self, db_name: &str, workflow: &str) -> String {
        format!(
            "update {} set state={} where db_name={} and workflow={}",
            self.config.vreplication_table(),
            encode_string(StreamState::Running.as_str()),
            encode_string(db_name),
            encode_string(workflow)
        )
    }

    pub fn delete_streams(&self, db_name: &str, workflow: &str) -> String {
        format!(
            "delete from {} where db_name={} and workflow={}",
            self.config.vreplication_table(),
            encode_string(db_name),
            encode_string(workflow)
        )
    }

    pub fn journal_entry(&self, migration_id: i64) -> String {
        format!(
            "select val from {} where id={}",
            self.config.journal_table(),
            migration_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TableSettings;
    use pretty_assertions::assert_eq;

    fn source() -> BinlogSource {
        BinlogSource {
            keyspace: "legacy".into(),
            shard: "0".into(),
            filter: Filter {
                rules: vec![Rule {
                    match_table: "customer".into(),
                    filter: "SELECT * FROM customer WHERE in_keyrange(id, 'sales.hash', '{{keyrange}}')"
                        .into(),
                }],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_source_json_shape() {
        let json = serde_json::to_string(&source()).unwrap();
        assert_eq!(
            json,
            r#"{"keyspace":"legacy","shard":"0","filter":{"rules":[{"match":"customer","filter":"SELECT * FROM customer WHERE in_keyrange(id, 'sales.hash', '{{keyrange}}')"}]}}"#
        );
    }

    #[test]
    fn test_template_render() {
        let config = EngineConfig::default();
        let mut generator = InsertGenerator::new(&config);
        generator
            .add_row(
                "movecust",
                &source(),
                "zone1",
                "primary",
                MigrationIntent::MoveTables,
                WorkflowSubType::None,
            )
            .unwrap();
        let template = generator.finish();
        assert_eq!(template.rows(), 1);

        let range = KeyRange::from_shard_name("-80").unwrap();
        let sql = template.render(&range, "vt_sales");
        assert!(sql.starts_with("insert into _vt.vreplication (workflow, source, pos,"));
        assert!(sql.contains(r"in_keyrange(id, \'sales.hash\', \'-80\')"));
        assert!(sql.contains("'Stopped', 'vt_sales', 1, 0)"));
        assert!(!sql.contains("{{"));
    }

    #[test]
    fn test_empty_generator() {
        let config = EngineConfig::default();
        let template = InsertGenerator::new(&config).finish();
        assert!(template.is_empty());
        assert_eq!(template.render(&KeyRange::full(), "vt_sales"), "");
    }

    #[test]
    fn test_render_leaves_caller_text_alone() {
        let expression = "select id, '{{keyrange}} {{dbname}}' as tag from notes";
        let spec = WorkflowSpec::builder("tagnotes", "legacy", "sales")
            .table(TableSettings::new("notes").with_source_expression(expression))
            .build()
            .unwrap();
        let slot = key_range_slot(&spec);
        assert_eq!(slot, "{{keyrange_1}}");

        let mut source = source();
        source.filter.rules = vec![Rule {
            match_table: "notes".into(),
            filter: format!(
                "{} where in_keyrange(id, 'sales.hash', '{}')",
                expression, slot
            ),
        }];
        let config = EngineConfig::default();
        let mut generator = InsertGenerator::new(&config).with_key_range_slot(&slot);
        generator
            .add_row(
                "tagnotes",
                &source,
                "",
                "",
                MigrationIntent::Materialize,
                WorkflowSubType::None,
            )
            .unwrap();
        let sql = generator
            .finish()
            .render(&KeyRange::from_shard_name("80-").unwrap(), "vt_sales");
        assert!(sql.contains(r"\'{{keyrange}} {{dbname}}\' as tag"), "{}", sql);
        assert!(sql.contains(r"in_keyrange(id, \'sales.hash\', \'80-\')"), "{}", sql);
        assert!(sql.contains("'Stopped', 'vt_sales', 0, 0)"), "{}", sql);
    }

    #[test]
    fn test_default_key_range_slot() {
        let spec = WorkflowSpec::builder("movecust", "legacy", "sales")
            .table(TableSettings::new("customer").with_source_expression("select * from customer"))
            .build()
            .unwrap();
        assert_eq!(key_range_slot(&spec), KEYRANGE_PLACEHOLDER);
    }

    #[test]
    fn test_control_statements() {
        let config = EngineConfig::default();
        let stmts = ControlStatements::new(&config);
        assert_eq!(
            stmts.start_streams("vt_sales", "movecust"),
            "update _vt.vreplication set state='Running' where db_name='vt_sales' and workflow='movecust'"
        );
        assert_eq!(
            stmts.frozen_workflows("vt_sales"),
            "select 1 from _vt.vreplication where db_name='vt_sales' and message='FROZEN' and workflow_sub_type != 1"
        );
        assert_eq!(
            stmts.journal_entry(7),
            "select val from _vt.resharding_journal where id=7"
        );
    }

    #[test]
    fn test_stream_records_from_rows() {
        let json = serde_json::to_string(&source()).unwrap();
        let result = QueryResult::with_rows(
            &["id", "state", "message", "source"],
            vec![vec![
                Some("3".into()),
                Some("Stopped".into()),
                Some("Stopped after copy".into()),
                Some(json),
            ]],
        );
        let records = StreamRecord::from_rows("email_lookup_vdx", "-80", &result).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 3);
        assert_eq!(records[0].state, StreamState::Stopped);
        assert_eq!(records[0].source, source());
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!("Paused".parse::<StreamState>().is_err());
    }
}
