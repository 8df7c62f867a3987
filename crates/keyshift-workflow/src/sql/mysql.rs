//! Default SQL capability backed by `sqlparser` with the MySQL dialect

use super::{unquote, ConstraintStrip, SelectItem, SelectShape, SqlParser};
use crate::error::{Result, WorkflowError};
use sqlparser::ast::{
    self, BinaryOperator, Expr, ObjectName, Select, SetExpr, Statement, TableConstraint,
    TableFactor,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

/// MySQL parser and printer
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlParser;

impl MySqlParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_one(&self, sql: &str) -> Result<Statement> {
        let mut statements = Parser::parse_sql(&MySqlDialect {}, sql)
            .map_err(|e| WorkflowError::validation(format!("failed to parse {}: {}", sql, e)))?;
        match statements.len() {
            1 => Ok(statements.remove(0)),
            n => Err(WorkflowError::validation(format!(
                "expected exactly one statement, found {}: {}",
                n, sql
            ))),
        }
    }
}

fn select_of<'a>(statement: &'a Statement, sql: &str) -> Result<&'a Select> {
    if let Statement::Query(query) = statement {
        if let SetExpr::Select(select) = query.body.as_ref() {
            return Ok(&**select);
        }
    }
    Err(WorkflowError::validation(format!("unrecognized statement: {}", sql)))
}

fn select_of_mut<'a>(statement: &'a mut Statement, sql: &str) -> Result<&'a mut Select> {
    if let Statement::Query(query) = statement {
        if let SetExpr::Select(select) = query.body.as_mut() {
            return Ok(&mut **select);
        }
    }
    Err(WorkflowError::validation(format!("unrecognized statement: {}", sql)))
}

/// Unqualified, unquoted table name
fn object_table_name(name: &ObjectName) -> String {
    let printed = name.to_string();
    let last = printed.rsplit('.').next().unwrap_or(printed.as_str());
    unquote(last).to_string()
}

fn from_table(select: &Select, sql: &str) -> Result<String> {
    let relation = select
        .from
        .first()
        .map(|t| &t.relation)
        .ok_or_else(|| WorkflowError::validation(format!("no table in query: {}", sql)))?;
    match relation {
        TableFactor::Table { name, .. } => Ok(object_table_name(name)),
        other => Err(WorkflowError::validation(format!(
            "unexpected table expression {} in query: {}",
            other, sql
        ))),
    }
}

fn select_item(expr: &Expr, alias: Option<String>) -> SelectItem {
    match expr {
        Expr::Identifier(ident) => SelectItem::Column {
            name: ident.value.clone(),
            text: ident.to_string(),
            alias,
        },
        Expr::CompoundIdentifier(idents) if !idents.is_empty() => SelectItem::Column {
            name: idents[idents.len() - 1].value.clone(),
            text: expr.to_string(),
            alias,
        },
        other => SelectItem::Expression {
            text: other.to_string(),
            alias,
        },
    }
}

impl SqlParser for MySqlParser {
    fn parse_select(&self, sql: &str) -> Result<SelectShape> {
        let statement = self.parse_one(sql)?;
        let select = select_of(&statement, sql)?;

        #[allow(unreachable_patterns)]
        let items = select
            .projection
            .iter()
            .map(|item| match item {
                ast::SelectItem::Wildcard(_) | ast::SelectItem::QualifiedWildcard(..) => {
                    SelectItem::Star
                }
                ast::SelectItem::UnnamedExpr(expr) => select_item(expr, None),
                ast::SelectItem::ExprWithAlias { expr, alias } => {
                    select_item(expr, Some(alias.value.clone()))
                }
                other => SelectItem::Expression {
                    text: other.to_string(),
                    alias: None,
                },
            })
            .collect();

        Ok(SelectShape {
            table: from_table(select, sql)?,
            items,
        })
    }

    fn add_where_conjunct(&self, sql: &str, predicate: &str) -> Result<String> {
        let mut statement = self.parse_one(sql)?;
        let dialect = MySqlDialect {};
        let predicate = Parser::new(&dialect)
            .try_with_sql(predicate)
            .and_then(|mut parser| parser.parse_expr())
            .map_err(|e| {
                WorkflowError::validation(format!("failed to parse {}: {}", predicate, e))
            })?;

        let select = select_of_mut(&mut statement, sql)?;
        select.selection = Some(match select.selection.take() {
            Some(existing) => {
                let existing = match existing {
                    Expr::BinaryOp {
                        op: BinaryOperator::Or | BinaryOperator::Xor,
                        ..
                    } => Expr::Nested(Box::new(existing)),
                    other => other,
                };
                Expr::BinaryOp {
                    left: Box::new(predicate),
                    op: BinaryOperator::And,
                    right: Box::new(existing),
                }
            }
            None => predicate,
        });
        Ok(statement.to_string())
    }

    fn strip_constraints(&self, ddl: &str, mode: ConstraintStrip) -> Result<String> {
        let mut statement = self.parse_one(ddl)?;
        let Statement::CreateTable(create) = &mut statement else {
            return Err(WorkflowError::validation(format!(
                "expected a create table statement: {}",
                ddl
            )));
        };
        create.constraints.retain(|constraint| match mode {
            ConstraintStrip::All => !matches!(
                constraint,
                TableConstraint::ForeignKey { .. } | TableConstraint::Check { .. }
            ),
            ConstraintStrip::ForeignKeys => {
                !matches!(constraint, TableConstraint::ForeignKey { .. })
            }
        });
        Ok(statement.to_string())
    }

    fn table_name(&self, sql: &str) -> Result<String> {
        let statement = self.parse_one(sql)?;
        match &statement {
            Statement::CreateTable(create) => Ok(object_table_name(&create.name)),
            _ => from_table(select_of(&statement, sql)?, sql),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CUSTOMER_DDL: &str = "CREATE TABLE customer (\
        id BIGINT NOT NULL, \
        region_id INT, \
        email VARCHAR(128), \
        PRIMARY KEY (id), \
        CONSTRAINT fk_region FOREIGN KEY (region_id) REFERENCES region (id), \
        CONSTRAINT chk_id CHECK (id > 0))";

    #[test]
    fn test_parse_select_items() {
        let shape = MySqlParser::new()
            .parse_select("select c.id, email as mail, upper(name) as n, * from sales.customer c")
            .unwrap();
        assert_eq!(shape.table, "customer");
        assert_eq!(
            shape.items,
            vec![
                SelectItem::Column {
                    name: "id".into(),
                    text: "c.id".into(),
                    alias: None
                },
                SelectItem::Column {
                    name: "email".into(),
                    text: "email".into(),
                    alias: Some("mail".into())
                },
                SelectItem::Expression {
                    text: "upper(name)".into(),
                    alias: Some("n".into())
                },
                SelectItem::Star,
            ]
        );
    }

    #[test]
    fn test_parse_select_rejects_non_select() {
        let parser = MySqlParser::new();
        assert!(parser.parse_select("delete from customer").is_err());
        assert!(parser.parse_select("select * from a; select * from b").is_err());
        assert!(parser.parse_select("select from where").is_err());
    }

    #[test]
    fn test_add_where_without_existing_clause() {
        let sql = MySqlParser::new()
            .add_where_conjunct(
                "select * from customer",
                "in_keyrange(id, 'sales.hash', '{{keyrange}}')",
            )
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM customer WHERE in_keyrange(id, 'sales.hash', '{{keyrange}}')"
        );
    }

    #[test]
    fn test_add_where_keeps_existing_clause() {
        let sql = MySqlParser::new()
            .add_where_conjunct(
                "select id from customer where a = 1 or b = 2",
                "in_keyrange(id, 'sales.hash', '{{keyrange}}')",
            )
            .unwrap();
        assert_eq!(
            sql,
            "SELECT id FROM customer WHERE in_keyrange(id, 'sales.hash', '{{keyrange}}') \
             AND (a = 1 OR b = 2)"
        );
    }

    #[test]
    fn test_strip_all_constraints() {
        let ddl = MySqlParser::new()
            .strip_constraints(CUSTOMER_DDL, ConstraintStrip::All)
            .unwrap();
        assert!(ddl.contains("PRIMARY KEY (id)"));
        assert!(!ddl.contains("FOREIGN KEY"));
        assert!(!ddl.contains("CHECK"));
    }

    #[test]
    fn test_strip_foreign_keys_only() {
        let ddl = MySqlParser::new()
            .strip_constraints(CUSTOMER_DDL, ConstraintStrip::ForeignKeys)
            .unwrap();
        assert!(!ddl.contains("FOREIGN KEY"));
        assert!(ddl.contains("CHECK (id > 0)"));
    }

    #[test]
    fn test_table_name() {
        let parser = MySqlParser::new();
        assert_eq!(parser.table_name("select * from `customer` where id = 1").unwrap(), "customer");
        assert_eq!(parser.table_name(CUSTOMER_DDL).unwrap(), "customer");
        assert_eq!(parser.table_name("select * from legacy.orders").unwrap(), "orders");
    }
}
