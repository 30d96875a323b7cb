//! Hash-partitioned fan-out over K sink workers
//!
//! Every upsert and delete for a primary key goes to the same worker
//! (`murmur2(key) mod K`), and each worker serializes its calls, so writes to
//! one key are applied in the order they were submitted. Bulk loads pick a
//! worker by lane. Schema operations always run on worker 0.

use ferry_rdbc::emitter::BoxedEmitter;
use ferry_rdbc::{PrimaryKeyValue, TableColumn, TableRow, TableSchema};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ReplicationError, Result};
use crate::hash::bucket_for;

/// Counters for routed operations
#[derive(Debug, Default)]
pub struct AtomicRouterStats {
    upserts: AtomicU64,
    deletes: AtomicU64,
    bulk_rows: AtomicU64,
    schema_changes: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`AtomicRouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Rows upserted
    pub upserts: u64,
    /// Rows deleted
    pub deletes: u64,
    /// Rows written through bulk loads
    pub bulk_rows: u64,
    /// Tables and columns created
    pub schema_changes: u64,
    /// Failed sink calls
    pub failures: u64,
}

impl AtomicRouterStats {
    /// Current values
    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            upserts: self.upserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bulk_rows: self.bulk_rows.load(Ordering::Relaxed),
            schema_changes: self.schema_changes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Routes sink calls to K independently serialized emitters
pub struct SinkRouter {
    workers: Vec<Mutex<BoxedEmitter>>,
    stats: AtomicRouterStats,
}

impl SinkRouter {
    /// Build a router over the given emitters (one per worker)
    pub fn new(emitters: Vec<BoxedEmitter>) -> Result<Self> {
        if emitters.is_empty() {
            return Err(ReplicationError::argument(
                "sink router needs at least one emitter",
            ));
        }
        Ok(Self {
            workers: emitters.into_iter().map(Mutex::new).collect(),
            stats: AtomicRouterStats::default(),
        })
    }

    /// Number of workers (K)
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker index owning `key`
    pub fn route(&self, key: &PrimaryKeyValue) -> usize {
        bucket_for(&key.key_bytes(), self.workers.len())
    }

    /// Operation counters
    pub fn stats(&self) -> RouterStats {
        self.stats.snapshot()
    }

    fn track<T>(&self, result: ferry_rdbc::Result<T>) -> Result<T> {
        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result?)
    }

    /// Current sink schema of a table (worker 0)
    pub async fn fetch_schema(&self, table: &str, namespace: &str) -> Result<Option<TableSchema>> {
        let worker = self.workers[0].lock().await;
        self.track(worker.fetch_schema(table, namespace).await)
    }

    /// Whether the sink can distribute tables (worker 0)
    pub async fn supports_distribution(&self) -> Result<bool> {
        let worker = self.workers[0].lock().await;
        self.track(worker.supports_distribution().await)
    }

    /// Create a table (worker 0)
    pub async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        let worker = self.workers[0].lock().await;
        self.track(worker.create_table(schema).await)?;
        self.stats.schema_changes.fetch_add(1, Ordering::Relaxed);
        debug!(table = %schema.qualified_name(), "Created table");
        Ok(())
    }

    /// Add a column (worker 0)
    pub async fn create_column(&self, schema: &TableSchema, column: &TableColumn) -> Result<()> {
        let worker = self.workers[0].lock().await;
        self.track(worker.create_column(schema, column).await)?;
        self.stats.schema_changes.fetch_add(1, Ordering::Relaxed);
        debug!(table = %schema.qualified_name(), column = %column.name, "Created column");
        Ok(())
    }

    /// Largest primary key in a table (worker 0)
    pub async fn max_primary_key(&self, schema: &TableSchema) -> Result<Option<PrimaryKeyValue>> {
        let worker = self.workers[0].lock().await;
        self.track(worker.max_primary_key(schema).await)
    }

    /// Insert or replace a row on the worker owning its key
    pub async fn upsert(&self, row: &TableRow) -> Result<()> {
        let worker = self.workers[self.route(row.primary_key())].lock().await;
        self.track(worker.upsert(row).await)?;
        self.stats.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete a row on the worker owning its key
    pub async fn delete(&self, key: &PrimaryKeyValue) -> Result<()> {
        let worker = self.workers[self.route(key)].lock().await;
        self.track(worker.delete(key).await)?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Bulk-load rows on worker `lane mod K`; returns rows written
    pub async fn bulk_load(&self, lane: usize, schema: &TableSchema, rows: &[TableRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let worker = self.workers[lane % self.workers.len()].lock().await;
        let written = self.track(worker.bulk_load(schema, rows).await)?;
        self.stats.bulk_rows.fetch_add(written, Ordering::Relaxed);
        Ok(written)
    }

    /// Close every worker.
    ///
    /// All workers are closed even when some fail; the failures are reported
    /// together.
    pub async fn close(&self) -> Result<()> {
        let mut failed = Vec::new();
        for (index, worker) in self.workers.iter().enumerate() {
            let worker = worker.lock().await;
            if let Err(e) = worker.close().await {
                warn!(worker = index, error = %e, "Failed to close sink worker");
                failed.push(format!("worker {}: {}", index, e));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ReplicationError::emission(format!(
                "failed to close sink: {}",
                failed.join("; ")
            )))
        }
    }
}

impl std::fmt::Debug for SinkRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRouter")
            .field("workers", &self.workers.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_rdbc::memory::{MemoryDatabase, Operation};
    use ferry_rdbc::{ColumnType, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new("public", "items")
                .with_column(TableColumn::new("id", ColumnType::Text))
                .with_column(TableColumn::new("v", ColumnType::Integer))
                .with_primary_key(["id"]),
        )
    }

    fn row(schema: &Arc<TableSchema>, id: &str, v: i64) -> TableRow {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::from(id));
        values.insert("v".to_string(), Value::Int64(v));
        TableRow::new(schema.clone(), values).unwrap()
    }

    fn router(db: &MemoryDatabase, workers: usize) -> SinkRouter {
        SinkRouter::new(
            (0..workers)
                .map(|i| Box::new(db.emitter(i)) as BoxedEmitter)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_router_rejected() {
        let err = SinkRouter::new(Vec::new()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_same_key_same_worker() {
        let db = MemoryDatabase::new();
        let router = router(&db, 4);
        let schema = schema();
        router.create_table(&schema).await.unwrap();

        for v in 0..5 {
            router.upsert(&row(&schema, "k1", v)).await.unwrap();
        }
        router
            .delete(row(&schema, "k1", 0).primary_key())
            .await
            .unwrap();

        let expected = router.route(row(&schema, "k1", 0).primary_key());
        let workers: Vec<_> = db
            .journal()
            .into_iter()
            .filter(|e| matches!(e.operation, Operation::Upsert | Operation::Delete))
            .map(|e| e.worker)
            .collect();
        assert_eq!(workers.len(), 6);
        assert!(workers.iter().all(|w| *w == expected));
        assert_eq!(db.row_count("public.items"), 0);
    }

    #[tokio::test]
    async fn test_schema_calls_on_worker_zero() {
        let db = MemoryDatabase::new();
        let router = router(&db, 3);
        let schema = schema();
        router.create_table(&schema).await.unwrap();
        router
            .create_column(&schema, &TableColumn::new("extra", ColumnType::Text))
            .await
            .unwrap();

        let journal = db.journal();
        assert_eq!(journal.len(), 2);
        assert!(journal.iter().all(|e| e.worker == 0));
        assert_eq!(router.stats().schema_changes, 2);
    }

    #[tokio::test]
    async fn test_bulk_load_uses_lane() {
        let db = MemoryDatabase::new();
        let router = router(&db, 2);
        let schema = schema();
        router.create_table(&schema).await.unwrap();

        let written = router
            .bulk_load(3, &schema, &[row(&schema, "a", 1), row(&schema, "b", 2)])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(router.bulk_load(0, &schema, &[]).await.unwrap(), 0);

        let bulk = db
            .journal()
            .into_iter()
            .find(|e| e.operation == Operation::BulkLoad)
            .unwrap();
        assert_eq!(bulk.worker, 1);
        assert_eq!(router.stats().bulk_rows, 2);
    }

    #[tokio::test]
    async fn test_close_reports_failures_after_closing_all() {
        let db = MemoryDatabase::new();
        let router = router(&db, 3);
        db.fail_next(Operation::Close, ferry_rdbc::Error::connection("reset"));

        let err = router.close().await.unwrap_err();
        assert!(err.to_string().contains("worker 0"));
        // the failed close is not journaled
        let closes = db
            .journal()
            .into_iter()
            .filter(|e| e.operation == Operation::Close)
            .count();
        assert_eq!(closes, 2);
    }
}
