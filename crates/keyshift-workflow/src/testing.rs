//! Testing utilities for the workflow engine
//!
//! [`FakeTabletManager`] keeps a schema, a replication control table and a
//! resharding journal per tablet and understands exactly the statements the
//! engine issues, so whole workflows can run against a [`MemoryTopology`]
//! without a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use keyshift_workflow::testing::*;
//!
//! #[tokio::test]
//! async fn test_move_customer() {
//!     let tmc = Arc::new(FakeTabletManager::new());
//!     tmc.add_table(&legacy_primary(), "customer", CUSTOMER_DDL);
//!     let engine = WorkflowEngine::new(sharded_sales_topology(), tmc.clone());
//!
//!     engine.move_tables(&request).await.unwrap();
//!     assert_eq!(tmc.streams(&sales_primary(0)).len(), 1);
//! }
//! ```

use crate::error::{Result, WorkflowError};
use crate::sql::{MySqlParser, SqlParser};
use crate::stream::{StreamRecord, StreamState};
use crate::tablet::{QueryResult, SchemaChange, SchemaDefinition, TableDefinition, TabletManagerClient};
use async_trait::async_trait;
use keyshift_topo::{
    AutoIncrement, ColumnVindex, KeyspaceVSchema, MemoryTopology, Table, Tablet, TabletAlias,
    Vindex,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

// ============================================================================
// Fixtures
// ============================================================================

/// `customer` table as reported by the legacy keyspace
pub const CUSTOMER_DDL: &str = "CREATE TABLE `customer` (\n  `id` bigint NOT NULL AUTO_INCREMENT,\n  `email` varchar(128) DEFAULT NULL,\n  PRIMARY KEY (`id`)\n) ENGINE=InnoDB";

/// Primary of the single `legacy` shard
pub fn legacy_primary() -> TabletAlias {
    TabletAlias::new("zone1", 100)
}

/// Primary of the `sales` shard at `index` (0 is `-80`, 1 is `80-`)
pub fn sales_primary(index: u32) -> TabletAlias {
    TabletAlias::new("zone1", 200 + index)
}

/// Unsharded `legacy` keyspace (shard `0`) and `sales` keyspace split into
/// `-80` and `80-`, with `customer` routed by `hash(id)` in `sales`
pub fn sharded_sales_topology() -> Arc<MemoryTopology> {
    let topo = MemoryTopology::new();
    topo.add_keyspace(
        "legacy",
        KeyspaceVSchema::unsharded().with_table(
            "customer",
            Table {
                auto_increment: Some(AutoIncrement {
                    column: "id".into(),
                    sequence: "customer_seq".into(),
                }),
                ..Default::default()
            },
        ),
    );
    topo.add_keyspace(
        "sales",
        KeyspaceVSchema::sharded()
            .with_vindex("hash", Vindex::new("hash"))
            .with_table(
                "customer",
                Table::default().with_column_vindex(ColumnVindex::single("id", "hash")),
            ),
    );

    let shards = [
        ("legacy", "0", legacy_primary()),
        ("sales", "-80", sales_primary(0)),
        ("sales", "80-", sales_primary(1)),
    ];
    for (keyspace, shard, alias) in shards {
        topo.add_shard_with_primary(keyspace, shard, Tablet::new(alias, keyspace, shard))
            .expect("fixture shard names are valid - this is a bug");
    }
    Arc::new(topo)
}

// ============================================================================
// Fake Tablet Manager
// ============================================================================

#[derive(Debug, Clone)]
struct StoredStream {
    shard: String,
    columns: BTreeMap<String, String>,
}

impl StoredStream {
    fn get(&self, column: &str) -> &str {
        self.columns.get(column).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Default)]
struct TabletState {
    tables: BTreeMap<String, TableDefinition>,
    schema_fetches: usize,
    schema_changes: Vec<SchemaChange>,
    streams: Vec<StoredStream>,
    next_id: i64,
    journal: HashSet<i64>,
}

/// In-memory stand-in for the tablet manager RPC client
#[derive(Default)]
pub struct FakeTabletManager {
    tablets: Mutex<HashMap<TabletAlias, TabletState>>,
    executed: Mutex<Vec<(TabletAlias, String)>>,
    failures: Mutex<Vec<(TabletAlias, String)>>,
    rejected_zones: Mutex<Vec<String>>,
}

impl FakeTabletManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tablet<R>(&self, alias: &TabletAlias, f: impl FnOnce(&mut TabletState) -> R) -> R {
        let mut tablets = self.tablets.lock();
        let state = tablets.entry(alias.clone()).or_insert_with(|| TabletState {
            next_id: 1,
            ..Default::default()
        });
        f(state)
    }

    // ==================== Setup ====================

    /// Add a table known only by its DDL
    pub fn add_table(&self, alias: &TabletAlias, name: &str, ddl: &str) {
        self.add_table_definition(
            alias,
            TableDefinition {
                name: name.to_string(),
                schema: ddl.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn add_table_definition(&self, alias: &TabletAlias, definition: TableDefinition) {
        self.with_tablet(alias, |state| {
            state.tables.insert(definition.name.clone(), definition);
        });
    }

    pub fn add_journal_entry(&self, alias: &TabletAlias, migration_id: i64) {
        self.with_tablet(alias, |state| {
            state.journal.insert(migration_id);
        });
    }

    /// Fail every call on `alias` whose operation or statement contains
    /// `needle`; operations are `get_schema` and `apply_schema`
    pub fn fail_on(&self, alias: &TabletAlias, needle: impl Into<String>) {
        self.failures.lock().push((alias.clone(), needle.into()));
    }

    /// Make the time zone check return NULL for `zone`
    pub fn reject_time_zone(&self, zone: impl Into<String>) {
        self.rejected_zones.lock().push(zone.into());
    }

    /// Overwrite state and message of every stream of `workflow`, the way
    /// the replication runtime does
    pub fn set_stream_state(
        &self,
        alias: &TabletAlias,
        workflow: &str,
        state: StreamState,
        message: &str,
    ) {
        self.with_tablet(alias, |tablet| {
            for stream in tablet
                .streams
                .iter_mut()
                .filter(|s| s.get("workflow") == workflow)
            {
                stream
                    .columns
                    .insert("state".into(), state.as_str().to_string());
                stream.columns.insert("message".into(), message.to_string());
            }
        });
    }

    /// Drop every stream on `alias`, leaving journal and schema in place
    pub fn clear_streams(&self, alias: &TabletAlias) {
        self.with_tablet(alias, |state| state.streams.clear());
    }

    // ==================== Inspection ====================

    pub fn has_table(&self, alias: &TabletAlias, name: &str) -> bool {
        self.with_tablet(alias, |state| state.tables.contains_key(name))
    }

    pub fn schema_fetches(&self, alias: &TabletAlias) -> usize {
        self.with_tablet(alias, |state| state.schema_fetches)
    }

    pub fn schema_changes(&self, alias: &TabletAlias) -> Vec<SchemaChange> {
        self.with_tablet(alias, |state| state.schema_changes.clone())
    }

    /// Streams stored on `alias`, decoded
    pub fn streams(&self, alias: &TabletAlias) -> Vec<StreamRecord> {
        self.with_tablet(alias, |state| {
            state
                .streams
                .iter()
                .filter_map(|s| {
                    Some(StreamRecord {
                        id: s.get("id").parse().ok()?,
                        workflow: s.get("workflow").to_string(),
                        shard: s.shard.clone(),
                        state: s.get("state").parse().ok()?,
                        message: s.get("message").to_string(),
                        source: serde_json::from_str(s.get("source")).ok()?,
                    })
                })
                .collect()
        })
    }

    /// Raw column value of the stream with `id` on `alias`
    pub fn stream_column(&self, alias: &TabletAlias, id: i64, column: &str) -> Option<String> {
        self.with_tablet(alias, |state| {
            state
                .streams
                .iter()
                .find(|s| s.get("id") == id.to_string())
                .map(|s| s.get(column).to_string())
        })
    }

    /// Control statements executed on any tablet containing `needle`
    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .filter(|(_, query)| query.contains(needle))
            .map(|(_, query)| query.clone())
            .collect()
    }

    /// Control statements executed on `alias`, in order
    pub fn executed_on(&self, alias: &TabletAlias) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .filter(|(a, _)| a == alias)
            .map(|(_, query)| query.clone())
            .collect()
    }

    fn check_failure(&self, tablet: &Tablet, operation: &str) -> Result<()> {
        let failures = self.failures.lock();
        match failures
            .iter()
            .find(|(alias, needle)| *alias == tablet.alias && operation.contains(needle.as_str()))
        {
            Some((_, needle)) => Err(WorkflowError::remote(
                format!("{}/{} ({})", tablet.keyspace, tablet.shard, tablet.alias),
                format!("injected failure on {}", needle),
            )),
            None => Ok(()),
        }
    }

    fn unsupported(tablet: &Tablet, query: &str) -> WorkflowError {
        WorkflowError::remote(&tablet.alias, format!("unsupported statement: {}", query))
    }
}

#[async_trait]
impl TabletManagerClient for FakeTabletManager {
    async fn get_schema(
        &self,
        tablet: &Tablet,
        tables: &[String],
        exclude_tables: &[String],
    ) -> Result<SchemaDefinition> {
        self.check_failure(tablet, "get_schema")?;
        Ok(self.with_tablet(&tablet.alias, |state| {
            state.schema_fetches += 1;
            SchemaDefinition {
                table_definitions: state
                    .tables
                    .values()
                    .filter(|t| tables.is_empty() || tables.contains(&t.name))
                    .filter(|t| !exclude_tables.contains(&t.name))
                    .cloned()
                    .collect(),
            }
        }))
    }

    async fn apply_schema(&self, tablet: &Tablet, change: &SchemaChange) -> Result<()> {
        self.check_failure(tablet, "apply_schema")?;
        let parser = MySqlParser::new();
        let mut created = Vec::new();
        for statement in change.sql.split(";\n") {
            let name = parser.table_name(statement)?;
            created.push(TableDefinition {
                name,
                schema: statement.to_string(),
                ..Default::default()
            });
        }
        self.with_tablet(&tablet.alias, |state| {
            state.schema_changes.push(change.clone());
            for definition in created {
                state.tables.insert(definition.name.clone(), definition);
            }
        });
        Ok(())
    }

    async fn vreplication_exec(&self, tablet: &Tablet, query: &str) -> Result<QueryResult> {
        self.check_failure(tablet, query)?;
        self.executed
            .lock()
            .push((tablet.alias.clone(), query.to_string()));

        let lowered = query.trim_start().to_ascii_lowercase();
        if lowered.starts_with("insert into") {
            let rows = parse_insert(query).ok_or_else(|| Self::unsupported(tablet, query))?;
            return Ok(self.with_tablet(&tablet.alias, |state| {
                let first = state.next_id;
                for columns in rows.iter() {
                    let mut columns = columns.clone();
                    columns.insert("id".into(), state.next_id.to_string());
                    columns.entry("message".into()).or_default();
                    state.next_id += 1;
                    state.streams.push(StoredStream {
                        shard: tablet.shard.clone(),
                        columns,
                    });
                }
                QueryResult {
                    rows_affected: rows.len() as u64,
                    insert_id: first as u64,
                    ..Default::default()
                }
            }));
        }

        let conditions = parse_conditions(where_clause(query));
        if lowered.starts_with("select val from") && lowered.contains("resharding_journal") {
            let id = conditions
                .iter()
                .find(|c| c.column == "id")
                .and_then(|c| c.value.parse::<i64>().ok())
                .ok_or_else(|| Self::unsupported(tablet, query))?;
            return Ok(self.with_tablet(&tablet.alias, |state| {
                let rows = if state.journal.contains(&id) {
                    vec![vec![Some("journal".to_string())]]
                } else {
                    Vec::new()
                };
                QueryResult::with_rows(&["val"], rows)
            }));
        }
        if lowered.starts_with("select 1 from") {
            return Ok(self.with_tablet(&tablet.alias, |state| {
                let rows = state
                    .streams
                    .iter()
                    .filter(|s| matches_all(s, &conditions))
                    .map(|_| vec![Some("1".to_string())])
                    .collect();
                QueryResult::with_rows(&["1"], rows)
            }));
        }
        if lowered.starts_with("select id, state, message, source from") {
            let fields = ["id", "state", "message", "source"];
            return Ok(self.with_tablet(&tablet.alias, |state| {
                let rows = state
                    .streams
                    .iter()
                    .filter(|s| matches_all(s, &conditions))
                    .map(|s| fields.iter().map(|f| Some(s.get(f).to_string())).collect())
                    .collect();
                QueryResult::with_rows(&fields, rows)
            }));
        }
        if lowered.starts_with("update") {
            let assignments = parse_conditions(set_clause(query));
            return Ok(self.with_tablet(&tablet.alias, |state| {
                let mut affected = 0;
                for stream in state
                    .streams
                    .iter_mut()
                    .filter(|s| matches_all(s, &conditions))
                {
                    for a in &assignments {
                        stream.columns.insert(a.column.clone(), a.value.clone());
                    }
                    affected += 1;
                }
                QueryResult::affected(affected)
            }));
        }
        if lowered.starts_with("delete from") {
            return Ok(self.with_tablet(&tablet.alias, |state| {
                let before = state.streams.len();
                state.streams.retain(|s| !matches_all(s, &conditions));
                QueryResult::affected((before - state.streams.len()) as u64)
            }));
        }
        Err(Self::unsupported(tablet, query))
    }

    async fn execute_fetch_as_app(
        &self,
        tablet: &Tablet,
        query: &str,
        _max_rows: usize,
    ) -> Result<QueryResult> {
        self.check_failure(tablet, query)?;
        if !query.contains("convert_tz") {
            return Err(Self::unsupported(tablet, query));
        }
        let rejected = self
            .rejected_zones
            .lock()
            .iter()
            .any(|zone| query.contains(&format!("'{}'", zone)));
        let value = (!rejected).then(|| "2006-01-02 15:04:05".to_string());
        Ok(QueryResult::with_rows(&["convert_tz"], vec![vec![value]]))
    }
}

// ============================================================================
// Statement parsing
// ============================================================================

static CONDITION_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(\w+)\s*(!=|=)\s*('(?:[^'\\]|\\.)*'|-?\d+)")
        .expect("condition regex pattern is invalid - this is a bug")
});

struct Condition {
    column: String,
    negated: bool,
    value: String,
}

fn where_clause(query: &str) -> &str {
    query.split_once(" where ").map(|(_, w)| w).unwrap_or_default()
}

fn set_clause(query: &str) -> &str {
    let after = query.split_once(" set ").map(|(_, s)| s).unwrap_or_default();
    after.split_once(" where ").map(|(s, _)| s).unwrap_or(after)
}

fn parse_conditions(clause: &str) -> Vec<Condition> {
    CONDITION_REGEX
        .captures_iter(clause)
        .map(|c| Condition {
            column: c[1].to_string(),
            negated: &c[2] == "!=",
            value: decode_literal(&c[3]),
        })
        .collect()
}

fn matches_all(stream: &StoredStream, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|c| (stream.get(&c.column) == c.value) != c.negated)
}

/// Decode a quoted string literal, or return a bare token as is
fn decode_literal(token: &str) -> String {
    let Some(inner) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) else {
        return token.trim().to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('Z') => out.push('\u{1a}'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Column/value maps of a multi-row insert
fn parse_insert(query: &str) -> Option<Vec<BTreeMap<String, String>>> {
    let (header, values) = query.split_once(" values ")?;
    let columns: Vec<String> = header
        .split_once('(')?
        .1
        .trim_end()
        .strip_suffix(')')?
        .split(',')
        .map(|c| c.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    let mut chars = values.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        match chars.next() {
            Some('(') => {}
            None => break,
            Some(_) => return None,
        }

        let mut tuple = Vec::new();
        loop {
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            let mut token = String::new();
            if chars.peek() == Some(&'\'') {
                token.push(chars.next()?);
                loop {
                    let c = chars.next()?;
                    token.push(c);
                    if c == '\\' {
                        token.push(chars.next()?);
                    } else if c == '\'' {
                        break;
                    }
                }
            }
            loop {
                match chars.peek() {
                    Some(',') | Some(')') | None => break,
                    Some(_) => token.push(chars.next()?),
                }
            }
            tuple.push(decode_literal(token.trim()));
            match chars.next() {
                Some(',') => continue,
                Some(')') => break,
                _ => return None,
            }
        }
        if tuple.len() != columns.len() {
            return None;
        }
        rows.push(columns.iter().cloned().zip(tuple).collect());
    }
    Some(rows)
}
