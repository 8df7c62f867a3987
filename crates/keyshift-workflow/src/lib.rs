//! # keyshift-workflow
//!
//! Cross-shard migration workflows for a sharded MySQL cluster.
//!
//! A workflow is a set of replication streams, one per (target shard,
//! source shard) pair, persisted in each target primary's control table.
//! The engine prepares the target schema, generates the streams, records
//! routing metadata and starts the streams. It never copies rows itself.
//!
//! - **MoveTables**: move tables to another keyspace, pinning routing to the
//!   source until traffic is switched
//! - **Materialize**: populate target tables from arbitrary source selects
//! - **CreateLookupVindex**: provision a lookup vindex, its backing table
//!   and the workflow that backfills it
//! - **ExternalizeVindex**: verify a backfill and make the vindex readable
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                         │
//! │  move_tables  materialize  create_lookup_vindex  externalize │
//! ├──────────────────────────────────────────────────────────────┤
//! │  resolver → schema deploy → filter rules → stream inserts    │
//! │                   journal guard → start                      │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  TopologyStore (vschema,     │  TabletManagerClient (schema, │
//! │  shards, routing rules)      │  control-table statements)    │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyshift_workflow::{MoveTablesRequest, TableSelection, WorkflowEngine};
//!
//! let engine = WorkflowEngine::new(topo, tablet_manager);
//! let request = MoveTablesRequest::new(
//!     "movecust",
//!     "legacy",
//!     "sales",
//!     TableSelection::parse("customer")?,
//! );
//! let created = engine.move_tables(&request).await?;
//! println!("{} streams created", created.total_streams());
//! ```

pub mod config;
pub(crate) mod context;
pub mod engine;
pub mod error;
pub mod externalize;
pub mod filter;
pub mod journal;
pub mod lookup;
pub mod materializer;
pub mod metrics;
pub mod movetables;
pub mod resolver;
pub(crate) mod schema;
pub mod settings;
pub mod sql;
pub mod stream;
pub mod tablet;
pub mod testing;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::WorkflowEngine;
pub use error::{AggregateError, ErrorKind, Result, WorkflowError};
pub use externalize::ExternalizedVindex;
pub use journal::migration_id;
pub use lookup::{BackingTable, CreateLookupVindexRequest, LookupParams};
pub use materializer::CreatedWorkflow;
pub use metrics::WorkflowMetrics;
pub use movetables::{MoveTablesRequest, TableSelection};
pub use settings::{CreateDdl, MigrationIntent, TableSettings, WorkflowSpec, WorkflowSpecBuilder};
pub use sql::{MySqlParser, SqlParser};
pub use stream::{BinlogSource, Filter, Rule, StreamRecord, StreamState, WorkflowSubType};
pub use tablet::{
    Field, QueryResult, SchemaChange, SchemaDefinition, TableDefinition, TabletManagerClient,
};
