//! Filter rule generation
//!
//! Rules are built once per workflow. A rule for a sharded target table
//! carries an `in_keyrange(...)` predicate whose key range is a slot picked
//! by [`key_range_slot`](crate::stream::key_range_slot), so the same rule
//! text serves every target shard and is only specialized when the insert is
//! rendered.

use crate::error::{Result, WorkflowError};
use crate::settings::{TableSettings, WorkflowSpec};
use crate::sql::{encode_string, escape_id, SelectItem, SelectShape, SqlParser};
use crate::stream::Rule;
use keyshift_topo::{best_column_vindex, KeyspaceVSchema};
use tracing::trace;

/// Build the filter rule of every table in `spec`
///
/// `key_range_slot` stands in for the target key range of sharded tables.
pub fn build_rules(
    parser: &dyn SqlParser,
    spec: &WorkflowSpec,
    target_vschema: &KeyspaceVSchema,
    key_range_slot: &str,
) -> Result<Vec<Rule>> {
    spec.table_settings
        .iter()
        .map(|ts| {
            build_rule(
                parser,
                &spec.target_keyspace,
                ts,
                target_vschema,
                key_range_slot,
            )
        })
        .collect()
}

fn build_rule(
    parser: &dyn SqlParser,
    target_keyspace: &str,
    ts: &TableSettings,
    target_vschema: &KeyspaceVSchema,
    key_range_slot: &str,
) -> Result<Rule> {
    if ts.source_expression.is_empty() {
        return Ok(Rule {
            match_table: ts.target_table.clone(),
            filter: String::new(),
        });
    }

    let shape = parser.parse_select(&ts.source_expression)?;
    let needs_range = target_vschema.sharded
        && !target_vschema
            .tables
            .get(&ts.target_table)
            .is_some_and(|t| t.is_reference());
    if !needs_range {
        return Ok(Rule {
            match_table: ts.target_table.clone(),
            filter: ts.source_expression.clone(),
        });
    }

    let table = target_vschema.tables.get(&ts.target_table).ok_or_else(|| {
        WorkflowError::not_found(format!(
            "table {} not found in vschema for keyspace {}",
            ts.target_table, target_keyspace
        ))
    })?;
    let (column_vindex, _) = best_column_vindex(target_vschema, table).ok_or_else(|| {
        WorkflowError::not_found(format!(
            "could not find a primary vindex for table {} in keyspace {}",
            ts.target_table, target_keyspace
        ))
    })?;

    let mut arguments = column_vindex
        .columns()
        .iter()
        .map(|column| match_column(&shape, column))
        .collect::<Result<Vec<_>>>()?;
    arguments.push(encode_string(&format!(
        "{}.{}",
        target_keyspace, column_vindex.name
    )));
    arguments.push(encode_string(key_range_slot));
    let predicate = format!("in_keyrange({})", arguments.join(", "));

    let filter = parser.add_where_conjunct(&ts.source_expression, &predicate)?;
    trace!(table = %ts.target_table, filter = %filter, "Generated filter");
    Ok(Rule {
        match_table: ts.target_table.clone(),
        filter,
    })
}

/// Source expression that feeds target `column` in the select list
///
/// A star projection feeds every column under its own name. A column
/// reference matches by its alias, or by its own name when unaliased.
/// Unaliased expressions cannot be matched and are skipped; an aliased
/// expression matching the vindex column is rejected.
fn match_column(shape: &SelectShape, column: &str) -> Result<String> {
    for item in &shape.items {
        match item {
            SelectItem::Star => return Ok(escape_id(column).into_owned()),
            SelectItem::Column { name, text, alias } => {
                let visible = alias.as_deref().unwrap_or(name);
                if visible.eq_ignore_ascii_case(column) {
                    return Ok(text.clone());
                }
            }
            SelectItem::Expression {
                alias: Some(alias), ..
            } if alias.eq_ignore_ascii_case(column) => {
                return Err(WorkflowError::validation(format!(
                    "vindex column {} of table {} cannot be a complex expression",
                    column, shape.table
                )));
            }
            SelectItem::Expression { .. } => {}
        }
    }
    Err(WorkflowError::validation(format!(
        "could not find vindex column {} in the select list of table {}",
        column, shape.table
    )))
}
