//! Workflow specifications
//!
//! A [`WorkflowSpec`] describes one materialization: which keyspaces are
//! involved, which tables are copied and how the target schema is created.
//! Specs can be built in code or deserialized from JSON/YAML:
//!
//! ```yaml
//! workflow: movecust
//! source_keyspace: legacy
//! target_keyspace: sales
//! intent: move_tables
//! table_settings:
//!   - target_table: customer
//!     source_expression: select * from customer
//!     create_ddl: copy
//! ```

use crate::error::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a workflow exists; persisted with every stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationIntent {
    #[default]
    Materialize,
    MoveTables,
    CreateLookupIndex,
}

impl MigrationIntent {
    /// Code stored in the `workflow_type` column
    pub const fn code(self) -> i64 {
        match self {
            Self::Materialize => 0,
            Self::MoveTables => 1,
            Self::CreateLookupIndex => 2,
        }
    }
}

/// How a missing target table gets created
///
/// Serialized as a string: empty for none, `copy`, `copy:drop_constraint`,
/// `copy:drop_foreign_keys`, or the literal DDL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CreateDdl {
    /// The table must already exist on every target shard
    #[default]
    None,
    Literal(String),
    /// Reuse the source table's DDL
    Copy,
    /// Reuse the source DDL without foreign keys and check constraints
    CopyDropConstraints,
    /// Reuse the source DDL without foreign keys
    CopyDropForeignKeys,
}

const COPY: &str = "copy";
const COPY_DROP_CONSTRAINT: &str = "copy:drop_constraint";
const COPY_DROP_FOREIGN_KEYS: &str = "copy:drop_foreign_keys";

impl From<String> for CreateDdl {
    fn from(value: String) -> Self {
        match value.trim() {
            "" => Self::None,
            COPY => Self::Copy,
            COPY_DROP_CONSTRAINT => Self::CopyDropConstraints,
            COPY_DROP_FOREIGN_KEYS => Self::CopyDropForeignKeys,
            _ => Self::Literal(value),
        }
    }
}

impl From<&str> for CreateDdl {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<CreateDdl> for String {
    fn from(value: CreateDdl) -> Self {
        match value {
            CreateDdl::None => String::new(),
            CreateDdl::Literal(ddl) => ddl,
            CreateDdl::Copy => COPY.to_string(),
            CreateDdl::CopyDropConstraints => COPY_DROP_CONSTRAINT.to_string(),
            CreateDdl::CopyDropForeignKeys => COPY_DROP_FOREIGN_KEYS.to_string(),
        }
    }
}

impl fmt::Display for CreateDdl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// Per-table materialization settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSettings {
    pub target_table: String,
    /// Select run against the source; empty copies the same-named table
    #[serde(default)]
    pub source_expression: String,
    #[serde(default)]
    pub create_ddl: CreateDdl,
}

impl TableSettings {
    pub fn new(target_table: impl Into<String>) -> Self {
        Self {
            target_table: target_table.into(),
            source_expression: String::new(),
            create_ddl: CreateDdl::None,
        }
    }

    pub fn with_source_expression(mut self, query: impl Into<String>) -> Self {
        self.source_expression = query.into();
        self
    }

    pub fn with_create_ddl(mut self, create_ddl: impl Into<CreateDdl>) -> Self {
        self.create_ddl = create_ddl.into();
        self
    }
}

/// A complete workflow request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub workflow: String,
    pub source_keyspace: String,
    pub target_keyspace: String,
    #[serde(default)]
    pub intent: MigrationIntent,
    #[serde(default)]
    pub cell: String,
    #[serde(default)]
    pub tablet_types: String,
    #[serde(default)]
    pub stop_after_copy: bool,
    /// Start streams once created
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub external_cluster: Option<String>,
    #[serde(default)]
    pub source_time_zone: Option<String>,
    #[serde(default)]
    pub target_time_zone: Option<String>,
    /// Restrict the workflow to these shards, making it partial
    #[serde(default)]
    pub source_shards: Vec<String>,
    pub table_settings: Vec<TableSettings>,
}

fn default_true() -> bool {
    true
}

impl WorkflowSpec {
    pub fn builder(
        workflow: impl Into<String>,
        source_keyspace: impl Into<String>,
        target_keyspace: impl Into<String>,
    ) -> WorkflowSpecBuilder {
        WorkflowSpecBuilder {
            spec: WorkflowSpec {
                workflow: workflow.into(),
                source_keyspace: source_keyspace.into(),
                target_keyspace: target_keyspace.into(),
                intent: MigrationIntent::Materialize,
                cell: String::new(),
                tablet_types: String::new(),
                stop_after_copy: false,
                auto_start: true,
                external_cluster: None,
                source_time_zone: None,
                target_time_zone: None,
                source_shards: Vec::new(),
                table_settings: Vec::new(),
            },
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.source_shards.is_empty()
    }

    /// Reject specs that cannot describe a workflow
    pub fn validate(&self) -> Result<()> {
        if self.workflow.trim().is_empty() {
            return Err(WorkflowError::validation("workflow name must not be empty"));
        }
        if self.source_keyspace.is_empty() || self.target_keyspace.is_empty() {
            return Err(WorkflowError::validation(format!(
                "workflow {} needs both a source and a target keyspace",
                self.workflow
            )));
        }
        if self.table_settings.is_empty() {
            return Err(WorkflowError::validation(format!(
                "workflow {} has no tables",
                self.workflow
            )));
        }
        if let Some(ts) = self.table_settings.iter().find(|ts| ts.target_table.is_empty()) {
            return Err(WorkflowError::validation(format!(
                "workflow {} has a table setting without a target table: {:?}",
                self.workflow, ts
            )));
        }
        if self.source_time_zone.is_some() != self.target_time_zone.is_some() {
            return Err(WorkflowError::validation(format!(
                "workflow {} must set source and target time zones together",
                self.workflow
            )));
        }
        Ok(())
    }
}

/// Builder for [`WorkflowSpec`]
#[derive(Debug, Clone)]
pub struct WorkflowSpecBuilder {
    spec: WorkflowSpec,
}

impl WorkflowSpecBuilder {
    pub fn intent(mut self, intent: MigrationIntent) -> Self {
        self.spec.intent = intent;
        self
    }

    pub fn cell(mut self, cell: impl Into<String>) -> Self {
        self.spec.cell = cell.into();
        self
    }

    pub fn tablet_types(mut self, tablet_types: impl Into<String>) -> Self {
        self.spec.tablet_types = tablet_types.into();
        self
    }

    pub fn stop_after_copy(mut self, stop: bool) -> Self {
        self.spec.stop_after_copy = stop;
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.spec.auto_start = auto_start;
        self
    }

    pub fn external_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.spec.external_cluster = Some(cluster.into());
        self
    }

    pub fn time_zones(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.spec.source_time_zone = Some(source.into());
        self.spec.target_time_zone = Some(target.into());
        self
    }

    pub fn source_shards<I, S>(mut self, shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.source_shards = shards.into_iter().map(Into::into).collect();
        self
    }

    pub fn table(mut self, settings: TableSettings) -> Self {
        self.spec.table_settings.push(settings);
        self
    }

    pub fn build(self) -> Result<WorkflowSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_ddl_strings() {
        assert_eq!(CreateDdl::from(""), CreateDdl::None);
        assert_eq!(CreateDdl::from("copy"), CreateDdl::Copy);
        assert_eq!(CreateDdl::from("copy:drop_constraint"), CreateDdl::CopyDropConstraints);
        assert_eq!(CreateDdl::from("copy:drop_foreign_keys"), CreateDdl::CopyDropForeignKeys);
        assert_eq!(
            CreateDdl::from("create table t (id int)"),
            CreateDdl::Literal("create table t (id int)".into())
        );
        assert_eq!(CreateDdl::CopyDropForeignKeys.to_string(), "copy:drop_foreign_keys");
    }

    #[test]
    fn test_intent_codes() {
        assert_eq!(MigrationIntent::Materialize.code(), 0);
        assert_eq!(MigrationIntent::MoveTables.code(), 1);
        assert_eq!(MigrationIntent::CreateLookupIndex.code(), 2);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
workflow: movecust
source_keyspace: legacy
target_keyspace: sales
intent: move_tables
table_settings:
  - target_table: customer
    source_expression: select * from customer
    create_ddl: copy
"#;
        let spec: WorkflowSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.intent, MigrationIntent::MoveTables);
        assert!(spec.auto_start);
        assert!(!spec.is_partial());
        assert_eq!(spec.table_settings[0].create_ddl, CreateDdl::Copy);
        spec.validate().unwrap();
    }

    #[test]
    fn test_builder_validates() {
        let err = WorkflowSpec::builder("wf", "legacy", "sales").build().unwrap_err();
        assert!(err.to_string().contains("has no tables"));

        let err = WorkflowSpec::builder("", "legacy", "sales")
            .table(TableSettings::new("customer"))
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let spec = WorkflowSpec::builder("wf", "legacy", "sales")
            .source_shards(["-80"])
            .table(TableSettings::new("customer").with_create_ddl("copy"))
            .build()
            .unwrap();
        assert!(spec.is_partial());
    }
}
