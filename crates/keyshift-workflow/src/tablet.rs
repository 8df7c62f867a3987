//! Tablet management RPC seam
//!
//! The engine never talks to MySQL directly. Every schema read, schema
//! change and control-table statement goes through a [`TabletManagerClient`]
//! addressed at a specific tablet.

use crate::error::Result;
use async_trait::async_trait;
use keyshift_topo::Tablet;
use serde::{Deserialize, Serialize};

/// Management RPCs served by every tablet
#[async_trait]
pub trait TabletManagerClient: Send + Sync {
    /// Fetch table definitions; an empty `tables` list means every table
    async fn get_schema(
        &self,
        tablet: &Tablet,
        tables: &[String],
        exclude_tables: &[String],
    ) -> Result<SchemaDefinition>;

    /// Apply a batch of DDL statements
    async fn apply_schema(&self, tablet: &Tablet, change: &SchemaChange) -> Result<()>;

    /// Run a statement against the replication control tables
    async fn vreplication_exec(&self, tablet: &Tablet, query: &str) -> Result<QueryResult>;

    /// Run a read-only statement as the application user
    async fn execute_fetch_as_app(
        &self,
        tablet: &Tablet,
        query: &str,
        max_rows: usize,
    ) -> Result<QueryResult>;
}

/// Schema of a tablet's database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub table_definitions: Vec<TableDefinition>,
}

impl SchemaDefinition {
    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.table_definitions.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.table_definitions.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    /// `CREATE TABLE` statement as reported by the server
    pub schema: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl TableDefinition {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// A column and its MySQL type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub column_type: String,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// A batch of DDL statements applied in one RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Statements joined by `;\n`
    pub sql: String,
    pub force: bool,
    pub allow_replication: bool,
    pub sql_mode: String,
}

/// Rows returned by a statement, in text protocol form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    pub fn with_rows(fields: &[&str], rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows,
            ..Default::default()
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of a named column in a row; NULL and unknown columns are `None`
    pub fn value(&self, row: usize, field: &str) -> Option<&str> {
        let column = self.fields.iter().position(|f| f == field)?;
        self.rows.get(row)?.get(column)?.as_deref()
    }
}
