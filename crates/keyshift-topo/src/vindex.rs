//! Vindex classification
//!
//! Vindex types are free-form strings in the VSchema document. This module
//! sorts them into the families the workflow engine cares about and picks
//! the primary vindex a row is routed by.

use crate::vschema::{ColumnVindex, KeyspaceVSchema, Table};

/// Vindex family derived from its type string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VindexKind {
    /// Computes the keyspace id from the column value alone
    Functional { unique: bool, cost: u32 },
    /// Backed by a lookup table kept in sync with an owner table
    Lookup { unique: bool, consistent: bool },
    Other,
}

/// Functional unique vindexes and their routing cost
const FUNCTIONAL_UNIQUE: &[(&str, u32)] = &[
    ("binary", 0),
    ("numeric", 0),
    ("hash", 1),
    ("xxhash", 1),
    ("binary_md5", 1),
    ("numeric_static_map", 1),
    ("unicode_loose_md5", 1),
    ("unicode_loose_xxhash", 1),
    ("reverse_bits", 1),
    ("region_json", 1),
    ("region_experimental", 1),
];

impl VindexKind {
    pub fn classify(vindex_type: &str) -> Self {
        if let Some((_, cost)) = FUNCTIONAL_UNIQUE.iter().find(|(t, _)| *t == vindex_type) {
            return VindexKind::Functional {
                unique: true,
                cost: *cost,
            };
        }
        if vindex_type.contains("lookup") {
            return VindexKind::Lookup {
                unique: vindex_type.contains("unique"),
                consistent: vindex_type.starts_with("consistent_lookup"),
            };
        }
        VindexKind::Other
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, VindexKind::Lookup { .. })
    }

    pub fn is_unique(&self) -> bool {
        match self {
            VindexKind::Functional { unique, .. } | VindexKind::Lookup { unique, .. } => *unique,
            VindexKind::Other => false,
        }
    }

    pub fn is_consistent_lookup(&self) -> bool {
        matches!(self, VindexKind::Lookup { consistent: true, .. })
    }
}

/// The column vindex rows of `table` are routed by, with its vindex type
///
/// Only functional unique vindexes qualify; the cheapest wins and ties keep
/// the earliest binding.
pub fn best_column_vindex<'a>(
    vschema: &'a KeyspaceVSchema,
    table: &'a Table,
) -> Option<(&'a ColumnVindex, &'a str)> {
    let mut best: Option<(&ColumnVindex, &str, u32)> = None;
    for column_vindex in &table.column_vindexes {
        let Some(vindex) = vschema.vindexes.get(&column_vindex.name) else {
            continue;
        };
        let VindexKind::Functional { unique: true, cost } =
            VindexKind::classify(&vindex.vindex_type)
        else {
            continue;
        };
        if best.map_or(true, |(_, _, best_cost)| cost < best_cost) {
            best = Some((column_vindex, vindex.vindex_type.as_str(), cost));
        }
    }
    best.map(|(cv, vindex_type, _)| (cv, vindex_type))
}

/// Family of a MySQL column type, as far as vindex selection is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnTypeClass {
    Integral,
    Text,
    Binary,
    Other,
}

impl ColumnTypeClass {
    /// Classify a column type such as `bigint unsigned` or `varchar(64)`
    pub fn of(column_type: &str) -> Self {
        let lowered = column_type.trim().to_ascii_lowercase();
        let base = lowered
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        match base {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year"
            | "int8" | "int16" | "int24" | "int32" | "int64" | "uint8" | "uint16" | "uint24"
            | "uint32" | "uint64" => ColumnTypeClass::Integral,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => {
                ColumnTypeClass::Text
            }
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                ColumnTypeClass::Binary
            }
            _ => ColumnTypeClass::Other,
        }
    }
}

/// Functional vindex suited to route rows by a column of the given type
pub fn vindex_for_column_type(column_type: &str) -> Option<&'static str> {
    match ColumnTypeClass::of(column_type) {
        ColumnTypeClass::Integral => Some("hash"),
        ColumnTypeClass::Text => Some("unicode_loose_md5"),
        ColumnTypeClass::Binary => Some("binary_md5"),
        ColumnTypeClass::Other => None,
    }
}
