//! Error types for keyshift-workflow
//!
//! Every failure maps onto one of six kinds:
//! - Validation, Conflict and NotFound are raised before anything is mutated
//! - Idempotency means a previous run left a journal entry behind
//! - Remote is a per-shard RPC or transport failure
//! - StateVerification means streams are not where externalization expects
//!
//! Fan-out phases never stop at the first failure; per-shard errors are
//! collected into an [`AggregateError`].

use keyshift_topo::TopoError;
use std::fmt;
use thiserror::Error;

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Error kinds, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Remote,
    NotFound,
    Validation,
    Conflict,
    StateVerification,
    Idempotency,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "REMOTE",
            Self::NotFound => "NOT_FOUND",
            Self::Validation => "VALIDATION",
            Self::Conflict => "CONFLICT",
            Self::StateVerification => "STATE_VERIFICATION",
            Self::Idempotency => "IDEMPOTENCY",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow engine errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    // ==================== Request Errors ====================
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    // ==================== Workflow State Errors ====================
    #[error(
        "found an entry from a previous run for migration id {migration_id} in \
         _vt.resharding_journal of tablets {}, please review and delete it before \
         proceeding and restart the workflow using the Workflow {keyspace}.{workflow} start",
        .tablets.join(",")
    )]
    Idempotency {
        migration_id: i64,
        tablets: Vec<String>,
        keyspace: String,
        workflow: String,
    },

    #[error("stream {stream_id} of workflow {workflow} on {shard}: {message}")]
    StateVerification {
        workflow: String,
        shard: String,
        stream_id: i64,
        message: String,
    },

    // ==================== Transport Errors ====================
    #[error("{target}: {message}")]
    Remote { target: String, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("topology error: {0}")]
    Topology(#[from] TopoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Fan-out ====================
    #[error(transparent)]
    Aggregate(AggregateError),
}

impl WorkflowError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a remote error for a tablet or shard
    pub fn remote(target: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::Remote {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    /// Kind of this error; aggregates report their most severe member
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Serialization(_) => {
                ErrorKind::Validation
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Idempotency { .. } => ErrorKind::Idempotency,
            Self::StateVerification { .. } => ErrorKind::StateVerification,
            Self::Remote { .. } | Self::Timeout { .. } => ErrorKind::Remote,
            Self::Topology(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Topology(e) if e.is_conflict() => ErrorKind::Conflict,
            Self::Topology(_) => ErrorKind::Remote,
            Self::Aggregate(agg) => agg.kind(),
        }
    }

    /// Metric-safe error code
    pub fn error_code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether a caller may retry the operation unchanged
    ///
    /// The engine itself never retries.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Aggregate(agg) => agg.errors.iter().all(|e| e.is_retriable()),
            _ => self.kind() == ErrorKind::Remote,
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<validator::ValidationErrors> for WorkflowError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::Config(e.to_string())
    }
}

/// Errors collected from every failing shard of a fan-out phase
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<WorkflowError>,
}

impl AggregateError {
    /// Merge collected errors: none is success, one is returned as-is
    pub fn merge(mut errors: Vec<WorkflowError>) -> Option<WorkflowError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(WorkflowError::Aggregate(AggregateError { errors })),
        }
    }

    pub fn errors(&self) -> &[WorkflowError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Most severe kind among the collected errors
    pub fn kind(&self) -> ErrorKind {
        self.errors
            .iter()
            .map(WorkflowError::kind)
            .max()
            .unwrap_or(ErrorKind::Remote)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
