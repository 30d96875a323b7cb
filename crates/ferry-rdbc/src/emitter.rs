//! The sink capability set
//!
//! A [`TableEmitter`] owns one connection (or one output stream) to the
//! relational side. Callers never share an emitter between concurrent
//! writers that need ordering; the router in `ferry-replicator` holds one
//! emitter per worker behind a mutex.

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::{PrimaryKeyValue, TableColumn, TableRow, TableSchema};

/// Persistence primitives used by the replicator
#[async_trait]
pub trait TableEmitter: Send + Sync {
    /// Short backend name for logs (`postgres`, `stdout`, `memory`)
    fn name(&self) -> &'static str;

    /// Introspect an existing table; `None` when it does not exist
    async fn fetch_schema(&self, table: &str, namespace: &str) -> Result<Option<TableSchema>>;

    /// Whether the sink shards tables natively (distribution columns apply)
    async fn supports_distribution(&self) -> Result<bool>;

    /// Create a table, its indexes and its distribution.
    ///
    /// Fails with `Error::TableExists` when the table is already present.
    async fn create_table(&self, schema: &TableSchema) -> Result<()>;

    /// Add a nullable column; adding an existing column is a no-op
    async fn create_column(&self, schema: &TableSchema, column: &TableColumn) -> Result<()>;

    /// Stream rows through the bulk text protocol; returns rows written
    async fn bulk_load(&self, schema: &TableSchema, rows: &[TableRow]) -> Result<u64>;

    /// Insert the row, or overwrite every non-key column of the existing row
    async fn upsert(&self, row: &TableRow) -> Result<()>;

    /// Delete by primary key; deleting an absent key is not an error
    async fn delete(&self, key: &PrimaryKeyValue) -> Result<()>;

    /// Largest primary key currently stored, for resuming interrupted loads
    async fn max_primary_key(&self, schema: &TableSchema) -> Result<Option<PrimaryKeyValue>>;

    /// Release the connection; later calls fail with `Error::Closed`
    async fn close(&self) -> Result<()>;
}

/// Boxed emitter, as held by the router
pub type BoxedEmitter = Box<dyn TableEmitter>;
