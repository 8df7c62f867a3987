//! SQL capability
//!
//! The engine needs only a handful of SQL operations: inspect a select
//! list, AND a predicate into a WHERE clause, strip constraints from a
//! `CREATE TABLE` and find the table a statement reads from. They sit
//! behind [`SqlParser`] so any conforming parser can be plugged in;
//! [`MySqlParser`] is the bundled default.

mod mysql;

pub use mysql::MySqlParser;

use crate::error::Result;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Parse, rewrite and print capability used by the engine
pub trait SqlParser: Send + Sync {
    /// Parse a single select statement into its table and select list
    fn parse_select(&self, sql: &str) -> Result<SelectShape>;

    /// AND `predicate` in front of the select's WHERE clause, or make it the
    /// WHERE clause when there is none
    fn add_where_conjunct(&self, sql: &str, predicate: &str) -> Result<String>;

    /// Remove table constraints from a `CREATE TABLE` statement
    fn strip_constraints(&self, ddl: &str, mode: ConstraintStrip) -> Result<String>;

    /// Table a select or `CREATE TABLE` statement refers to
    fn table_name(&self, sql: &str) -> Result<String>;
}

/// Which table constraints to remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintStrip {
    /// Foreign keys and check constraints
    All,
    ForeignKeys,
}

/// Select statement reduced to what the filter generator inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectShape {
    pub table: String,
    pub items: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    /// `*` or `t.*`
    Star,
    /// Plain column reference, optionally aliased
    Column {
        name: String,
        /// Column as written, including any qualifier
        text: String,
        alias: Option<String>,
    },
    /// Anything else
    Expression { text: String, alias: Option<String> },
}

// ==================== Escaping ====================

static PLAIN_IDENTIFIER: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .expect("identifier regex pattern is invalid - this is a bug")
});

/// Keywords that cannot appear unquoted in generated statements
const RESERVED: &[&str] = &[
    "add", "all", "and", "as", "by", "case", "create", "delete", "desc", "distinct", "drop",
    "from", "group", "having", "in", "index", "insert", "interval", "into", "is", "join", "key",
    "like", "limit", "not", "null", "on", "or", "order", "primary", "select", "set", "table",
    "to", "union", "update", "where",
];

/// Backtick-quote an identifier unless it is a plain, non-reserved name
pub fn escape_id(name: &str) -> Cow<'_, str> {
    let lowered = name.to_ascii_lowercase();
    if PLAIN_IDENTIFIER.is_match(name) && !RESERVED.contains(&lowered.as_str()) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(quote_id(name))
    }
}

/// Backtick-quote an identifier unconditionally
pub fn quote_id(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Encode a value as a single-quoted SQL string literal
pub fn encode_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '\u{1a}' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Strip surrounding backticks or double quotes from an identifier
pub(crate) fn unquote(name: &str) -> &str {
    let name = name.trim();
    for q in ['`', '"'] {
        if let Some(inner) = name.strip_prefix(q).and_then(|n| n.strip_suffix(q)) {
            return inner;
        }
    }
    name
}
