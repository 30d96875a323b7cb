//! Error types for ferry-replicator
//!
//! Every failure the engine can surface maps onto one process exit code:
//! invalid arguments exit with 3, data/schema/emission failures with 1 and
//! unexpected faults with 2.

use std::fmt;
use thiserror::Error;

/// Result type alias for replicator operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Destructive or unexpected difference between source and sink schemas
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaConflict {
    /// Table exists in the sink when it was expected to be absent
    TableExists {
        /// Qualified table name
        table: String,
    },
    /// Table is missing (in the source, or in the sink when it must exist)
    TableMissing {
        /// Table name
        table: String,
    },
    /// Same-named column with a different type
    ColumnTypeMismatch {
        /// Qualified table name
        table: String,
        /// Column name
        column: String,
        /// Type currently in the sink
        existing: String,
        /// Type derived from the source
        desired: String,
    },
    /// Sink table keyed on different columns than the source
    PrimaryKeyMismatch {
        /// Qualified table name
        table: String,
        /// Key columns in the sink
        existing: Vec<String>,
        /// Key columns derived from the source
        desired: Vec<String>,
    },
}

impl fmt::Display for SchemaConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableExists { table } => write!(f, "table {} already exists", table),
            Self::TableMissing { table } => write!(f, "table {} does not exist", table),
            Self::ColumnTypeMismatch {
                table,
                column,
                existing,
                desired,
            } => write!(
                f,
                "column {}.{} is {} in the sink but {} in the source",
                table, column, existing, desired
            ),
            Self::PrimaryKeyMismatch {
                table,
                existing,
                desired,
            } => write!(
                f,
                "table {} is keyed on ({}) but the source key is ({})",
                table,
                existing.join(", "),
                desired.join(", ")
            ),
        }
    }
}

/// Main error type for the replicator
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid configuration or command line
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Source and sink schemas cannot be reconciled
    #[error("schema conflict: {0}")]
    SchemaConflict(SchemaConflict),

    /// Sink I/O failed
    #[error("emission error: {message}")]
    Emission {
        /// What was being written
        message: String,
        /// Underlying sink error
        #[source]
        source: Option<ferry_rdbc::Error>,
    },

    /// Source store call failed
    #[error("source error: {message}")]
    Source {
        /// Description of the failure
        message: String,
        /// The source rejected the call for exceeding provisioned throughput
        throttled: bool,
        /// The call may succeed when repeated
        retriable: bool,
    },

    /// Lease store failure (losing a lease race is not an error)
    #[error("lease error: {0}")]
    Lease(String),

    /// Local file I/O failed (scan progress files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Work was stopped by cancellation
    #[error("cancelled")]
    Cancelled,

    /// Unexpected fault
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an argument error
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    /// Create an emission error without a sink cause
    pub fn emission(message: impl Into<String>) -> Self {
        Self::Emission {
            message: message.into(),
            source: None,
        }
    }

    /// Create a non-retriable source error
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            throttled: false,
            retriable: false,
        }
    }

    /// Create a retriable source error
    pub fn source_transient(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            throttled: false,
            retriable: true,
        }
    }

    /// Create a throttling error
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            throttled: true,
            retriable: true,
        }
    }

    /// Create a lease error
    pub fn lease(message: impl Into<String>) -> Self {
        Self::Lease(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Argument(_) => 3,
            Self::Internal(_) => 2,
            Self::SchemaConflict(_)
            | Self::Emission { .. }
            | Self::Source { .. }
            | Self::Lease(_)
            | Self::Io(_)
            | Self::Cancelled => 1,
        }
    }

    /// Whether repeating the failed call may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Source { retriable, .. } => *retriable,
            Self::Emission {
                source: Some(cause),
                ..
            } => cause.is_retriable(),
            _ => false,
        }
    }

    /// Whether the source reported throttling
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Source { throttled: true, .. })
    }

    /// Whether this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<SchemaConflict> for ReplicationError {
    fn from(conflict: SchemaConflict) -> Self {
        Self::SchemaConflict(conflict)
    }
}

impl From<ferry_rdbc::Error> for ReplicationError {
    fn from(err: ferry_rdbc::Error) -> Self {
        match err {
            ferry_rdbc::Error::TableExists { table } => {
                Self::SchemaConflict(SchemaConflict::TableExists { table })
            }
            ferry_rdbc::Error::TableNotFound { table } => {
                Self::SchemaConflict(SchemaConflict::TableMissing { table })
            }
            other => Self::Emission {
                message: other.to_string(),
                source: Some(other),
            },
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {}", err))
    }
}

impl From<tokio::task::JoinError> for ReplicationError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Internal(format!("worker task panicked: {}", err))
        }
    }
}
