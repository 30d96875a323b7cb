//! Shared, evolving view of one sink table's schema
//!
//! Readers take cheap `Arc` snapshots. Column additions are serialized by an
//! async mutex and re-checked under it, so concurrent workers that discover
//! the same new attribute create the column once.

use ferry_rdbc::{TableColumn, TableRow, TableSchema};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;
use crate::router::SinkRouter;
use crate::source::Item;
use crate::translator::SchemaTranslator;

/// Current schema of a replicated table
pub struct LiveSchema {
    current: RwLock<Arc<TableSchema>>,
    version: AtomicU64,
    evolve: Mutex<()>,
}

impl LiveSchema {
    /// Start from a schema already present in the sink
    pub fn new(schema: TableSchema) -> Self {
        Self {
            current: RwLock::new(Arc::new(schema)),
            version: AtomicU64::new(0),
            evolve: Mutex::new(()),
        }
    }

    /// Latest published schema
    pub fn snapshot(&self) -> Arc<TableSchema> {
        self.current.read().clone()
    }

    /// Number of column additions published so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Make sure every column in `columns` exists, creating missing ones in
    /// the sink first. Returns the schema to write against.
    pub async fn ensure_columns(
        &self,
        columns: &[TableColumn],
        router: &SinkRouter,
    ) -> Result<Arc<TableSchema>> {
        let snapshot = self.snapshot();
        if columns.iter().all(|c| snapshot.has_column(&c.name)) {
            return Ok(snapshot);
        }

        let _guard = self.evolve.lock().await;
        let mut schema = (*self.snapshot()).clone();
        let mut added = 0;
        for column in columns {
            if schema.has_column(&column.name) {
                continue;
            }
            router.create_column(&schema, column).await?;
            schema.add_column(column.clone())?;
            added += 1;
            info!(
                table = %schema.qualified_name(),
                column = %column.name,
                column_type = %column.column_type,
                "Added column"
            );
        }

        let schema = Arc::new(schema);
        if added > 0 {
            *self.current.write() = schema.clone();
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        Ok(schema)
    }

    /// Translate an item into a row, creating any columns it introduces
    pub async fn materialize(
        &self,
        translator: &SchemaTranslator,
        item: &Item,
        router: &SinkRouter,
    ) -> Result<TableRow> {
        let translation = translator.translate(item, &self.snapshot())?;
        let schema = self.ensure_columns(&translation.new_columns, router).await?;
        Ok(TableRow::new(schema, translation.values)?)
    }
}

impl std::fmt::Debug for LiveSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSchema")
            .field("table", &self.snapshot().qualified_name())
            .field("version", &self.version())
            .finish()
    }
}
