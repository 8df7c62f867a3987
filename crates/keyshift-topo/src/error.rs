//! Topology error types

use thiserror::Error;

/// Result type for topology operations
pub type TopoResult<T> = std::result::Result<T, TopoError>;

/// Topology store errors
#[derive(Debug, Error)]
pub enum TopoError {
    // ==================== Lookup Errors ====================
    #[error("node doesn't exist: {0}")]
    NoNode(String),

    #[error("keyspace not found: {0}")]
    KeyspaceNotFound(String),

    #[error("tablet not found: {0}")]
    TabletNotFound(String),

    #[error("external cluster not found: {0}")]
    ExternalClusterNotFound(String),

    // ==================== Write Errors ====================
    #[error("bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("{kind} {name} already exists with a different definition")]
    DefinitionConflict { kind: &'static str, name: String },

    // ==================== Decoding Errors ====================
    #[error("invalid key range {input}: {reason}")]
    InvalidKeyRange { input: String, reason: String },

    #[error("invalid tablet alias: {0}")]
    InvalidTabletAlias(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Transport Errors ====================
    #[error("topology server unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TopoError {
    /// Check if this error means the requested object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TopoError::NoNode(_)
                | TopoError::KeyspaceNotFound(_)
                | TopoError::TabletNotFound(_)
                | TopoError::ExternalClusterNotFound(_)
        )
    }

    /// Check if this error was caused by a concurrent writer
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TopoError::BadVersion { .. }
                | TopoError::NodeExists(_)
                | TopoError::DefinitionConflict { .. }
        )
    }
}

impl From<serde_json::Error> for TopoError {
    fn from(e: serde_json::Error) -> Self {
        TopoError::Serialization(e.to_string())
    }
}
