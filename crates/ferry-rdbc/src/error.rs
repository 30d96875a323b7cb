//! Error types for ferry-rdbc
//!
//! Sink failures are classified so callers can tell transient I/O problems
//! (connection loss, timeouts, deadlocks) apart from problems that will not
//! go away on retry (constraint violations, type errors, schema mismatches).

use std::fmt;
use thiserror::Error;

/// Result type for ferry-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of sink failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Sink connection lost or refused
    Connection,
    /// Query execution errors
    Query,
    /// Key or not-null constraint rejected a row
    Constraint,
    /// A value did not fit its column
    TypeConversion,
    /// Timeout errors (retriable)
    Timeout,
    /// Deadlock between concurrent workers
    Deadlock,
    /// Configuration error
    Configuration,
    /// Schema-related errors (table exists / missing, column mismatch)
    Schema,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Connection loss, timeouts and deadlocks may succeed on retry
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Deadlock)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Constraint => "constraint",
            Self::TypeConversion => "type_conversion",
            Self::Timeout => "timeout",
            Self::Deadlock => "deadlock",
            Self::Configuration => "configuration",
            Self::Schema => "schema",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Main error type for ferry-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Constraint violation (PK, unique, check, not-null)
    #[error("constraint violation: {constraint_name} - {message}")]
    Constraint {
        constraint_name: String,
        message: String,
    },

    /// Value could not be represented in the target column type
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Deadlock detected
    #[error("deadlock detected")]
    Deadlock,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Schema error (column mismatch, invalid schema definition)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Table already exists in the sink
    #[error("table already exists: {table}")]
    TableExists { table: String },

    /// Table does not exist in the sink
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Operation is not supported by this emitter
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Emitter was already closed
    #[error("emitter is closed")]
    Closed,

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } | Self::Closed => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Schema { .. } | Self::TableExists { .. } | Self::TableNotFound { .. } => {
                ErrorCategory::Schema
            }
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a constraint violation error
    pub fn constraint(constraint_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            constraint_name: constraint_name.into(),
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a table-exists error
    pub fn table_exists(table: impl Into<String>) -> Self {
        Self::TableExists {
            table: table.into(),
        }
    }

    /// Create a table-not-found error
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The SQL text associated with a query error, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::TypeConversion {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_categories() {
        assert!(Error::connection("reset by peer").is_retriable());
        assert!(Error::timeout("statement timeout").is_retriable());
        assert!(Error::Deadlock.is_retriable());
        assert!(Error::Closed.is_retriable());

        assert!(!Error::constraint("orders_pkey", "duplicate key").is_retriable());
        assert!(!Error::type_conversion("bad numeric").is_retriable());
        assert!(!Error::table_exists("public.orders").is_retriable());
    }

    #[test]
    fn test_schema_variants_share_category() {
        assert_eq!(Error::schema("x").category(), ErrorCategory::Schema);
        assert_eq!(Error::table_exists("t").category(), ErrorCategory::Schema);
        assert_eq!(Error::table_not_found("t").category(), ErrorCategory::Schema);
    }

    #[test]
    fn test_query_error_keeps_sql() {
        let err = Error::query_with_sql("syntax error", "SELEC 1");
        assert_eq!(err.sql(), Some("SELEC 1"));
        assert_eq!(err.to_string(), "query error: syntax error");
        assert_eq!(Error::query("x").sql(), None);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::TypeConversion.to_string(), "type_conversion");
        assert_eq!(ErrorCategory::Connection.to_string(), "connection");
    }
}
