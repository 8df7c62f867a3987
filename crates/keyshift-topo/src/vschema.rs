//! VSchema documents and routing rules
//!
//! A keyspace's VSchema tells the query router how rows are distributed:
//! which vindexes exist and how each table binds its columns to them.
//! Documents serialize to the same JSON shape operators edit by hand:
//!
//! ```json
//! {
//!   "sharded": true,
//!   "vindexes": { "hash": { "type": "hash" } },
//!   "tables": {
//!     "customer": { "column_vindexes": [{ "column": "id", "name": "hash" }] }
//!   }
//! }
//! ```

use crate::error::{TopoError, TopoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Table type marker for tables replicated in full to every shard
pub const TABLE_TYPE_REFERENCE: &str = "reference";

/// Routing metadata document for one keyspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceVSchema {
    #[serde(default)]
    pub sharded: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vindexes: BTreeMap<String, Vindex>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, Table>,
}

impl KeyspaceVSchema {
    pub fn sharded() -> Self {
        Self {
            sharded: true,
            ..Default::default()
        }
    }

    pub fn unsharded() -> Self {
        Self::default()
    }

    pub fn with_vindex(mut self, name: impl Into<String>, vindex: Vindex) -> Self {
        self.vindexes.insert(name.into(), vindex);
        self
    }

    pub fn with_table(mut self, name: impl Into<String>, table: Table) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Add a vindex, accepting an identical existing definition
    pub fn merge_vindex(&mut self, name: &str, vindex: Vindex) -> TopoResult<()> {
        match self.vindexes.get(name) {
            Some(existing) if *existing != vindex => Err(TopoError::DefinitionConflict {
                kind: "vindex",
                name: name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.vindexes.insert(name.to_string(), vindex);
                Ok(())
            }
        }
    }

    /// Add a table, accepting an identical existing definition
    pub fn merge_table(&mut self, name: &str, table: Table) -> TopoResult<()> {
        match self.tables.get(name) {
            Some(existing) if *existing != table => Err(TopoError::DefinitionConflict {
                kind: "table",
                name: name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.tables.insert(name.to_string(), table);
                Ok(())
            }
        }
    }
}

/// A named sharding function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vindex {
    #[serde(rename = "type")]
    pub vindex_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Table whose writes keep a lookup vindex populated
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
}

impl Vindex {
    pub fn new(vindex_type: impl Into<String>) -> Self {
        Self {
            vindex_type: vindex_type.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn has_owner(&self) -> bool {
        !self.owner.is_empty()
    }
}

/// A table's routing definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub table_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_vindexes: Vec<ColumnVindex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<AutoIncrement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub column_list_authoritative: bool,
}

impl Table {
    pub fn with_column_vindex(mut self, column_vindex: ColumnVindex) -> Self {
        self.column_vindexes.push(column_vindex);
        self
    }

    pub fn is_reference(&self) -> bool {
        self.table_type == TABLE_TYPE_REFERENCE
    }
}

/// Binding of a table column (or column list) to a vindex
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnVindex {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub column: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    pub name: String,
}

impl ColumnVindex {
    pub fn single(column: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            columns: Vec::new(),
            name: name.into(),
        }
    }

    pub fn multi(columns: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            column: String::new(),
            columns,
            name: name.into(),
        }
    }

    /// Bound columns in order; the single-column form wins when both are set
    pub fn columns(&self) -> Vec<String> {
        if !self.column.is_empty() {
            vec![self.column.clone()]
        } else {
            self.columns.clone()
        }
    }
}

/// Sequence binding for an auto-increment column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoIncrement {
    pub column: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub column_type: String,
}

// ==================== Routing Rules ====================

/// Global table routing rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRules {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub from_table: String,
    pub to_tables: Vec<String>,
}

impl RoutingRules {
    pub fn get(&self, from_table: &str) -> Option<&[String]> {
        self.rules
            .iter()
            .find(|r| r.from_table == from_table)
            .map(|r| r.to_tables.as_slice())
    }

    /// Route `from_table` to `to_tables`, accepting an identical existing rule
    pub fn merge(&mut self, from_table: &str, to_tables: Vec<String>) -> TopoResult<()> {
        match self.get(from_table) {
            Some(existing) if existing != to_tables.as_slice() => {
                Err(TopoError::DefinitionConflict {
                    kind: "routing rule",
                    name: from_table.to_string(),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.rules.push(RoutingRule {
                    from_table: from_table.to_string(),
                    to_tables,
                });
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
