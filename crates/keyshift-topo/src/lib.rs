//! # keyshift-topo
//!
//! Topology metadata model for keyshift.
//!
//! - **Key ranges**: the slice of keyspace ids a shard owns
//! - **Shards and tablets**: point-in-time shard records and their primaries
//! - **VSchema**: per-keyspace routing documents and global routing rules
//! - **Vindexes**: classification of sharding functions
//! - **Store**: the [`TopologyStore`] seam plus an in-memory implementation
//!
//! ```rust
//! use keyshift_topo::KeyRange;
//!
//! let low = KeyRange::from_shard_name("-80").unwrap();
//! let high = KeyRange::from_shard_name("80-").unwrap();
//! assert!(!low.intersects(&high));
//! ```

pub mod error;
pub mod key_range;
pub mod memory;
pub mod shard;
pub mod store;
pub mod vindex;
pub mod vschema;

pub use error::{TopoError, TopoResult};
pub use key_range::KeyRange;
pub use memory::MemoryTopology;
pub use shard::{ShardInfo, Tablet, TabletAlias, TabletType};
pub use store::TopologyStore;
pub use vindex::{best_column_vindex, vindex_for_column_type, ColumnTypeClass, VindexKind};
pub use vschema::{
    AutoIncrement, Column, ColumnVindex, KeyspaceVSchema, RoutingRule, RoutingRules, Table,
    Vindex, TABLE_TYPE_REFERENCE,
};
