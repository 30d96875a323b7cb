//! SQL script emitter
//!
//! Used when no sink URL is configured: every operation is written to a
//! writer (stdout by default) as a runnable psql script. Bulk loads become
//! inline `COPY ... FROM STDIN` blocks terminated by `\.`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::copy::{encode_rows, END_OF_DATA};
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::emitter::TableEmitter;
use crate::error::{Error, Result};
use crate::schema::{PrimaryKeyValue, TableColumn, TableRow, TableSchema};

/// Emitter printing SQL statements instead of executing them
pub struct StdoutEmitter {
    writer: Mutex<Box<dyn Write + Send>>,
    dialect: PostgresDialect,
    distribution: bool,
    closed: AtomicBool,
}

impl StdoutEmitter {
    /// Write to the process's standard output
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Write to an arbitrary writer
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            dialect: PostgresDialect,
            distribution: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Emit `create_distributed_table` calls for distributed schemas
    pub fn with_distribution(mut self, distribution: bool) -> Self {
        self.distribution = distribution;
        self
    }

    fn write(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut writer = self.writer.lock();
        writer.write_all(text.as_bytes())?;
        Ok(())
    }

    fn statement(&self, sql: &str) -> Result<()> {
        self.write(&format!("{};\n", sql))
    }
}

impl Default for StdoutEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableEmitter for StdoutEmitter {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn fetch_schema(&self, _table: &str, _namespace: &str) -> Result<Option<TableSchema>> {
        Ok(None)
    }

    async fn supports_distribution(&self) -> Result<bool> {
        Ok(self.distribution)
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        schema.validate()?;
        for sql in self.dialect.create_table_sql(schema) {
            self.statement(&sql)?;
        }
        Ok(())
    }

    async fn create_column(&self, schema: &TableSchema, column: &TableColumn) -> Result<()> {
        self.statement(&self.dialect.add_column_sql(schema, column))
    }

    async fn bulk_load(&self, schema: &TableSchema, rows: &[TableRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut block = format!("{};\n", self.dialect.copy_from_stdin_sql(schema));
        block.push_str(&encode_rows(schema, rows));
        block.push_str(END_OF_DATA);
        block.push('\n');
        self.write(&block)?;
        Ok(rows.len() as u64)
    }

    async fn upsert(&self, row: &TableRow) -> Result<()> {
        let schema = row.schema();
        let values = schema
            .columns()
            .iter()
            .map(|c| self.dialect.literal(&row.value_or_null(&c.name)))
            .collect();
        self.statement(&self.dialect.upsert_statement(schema, values))
    }

    async fn delete(&self, key: &PrimaryKeyValue) -> Result<()> {
        let values = key.values().iter().map(|v| self.dialect.literal(v)).collect();
        self.statement(&self.dialect.delete_statement(key.schema(), values))
    }

    async fn max_primary_key(&self, _schema: &TableSchema) -> Result<Option<PrimaryKeyValue>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnType, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new("public", "t")
                .with_column(TableColumn::new("k", ColumnType::Text))
                .with_column(TableColumn::new("v", ColumnType::Integer))
                .with_primary_key(["k"]),
        )
    }

    fn row(k: &str, v: i64) -> TableRow {
        let mut values = BTreeMap::new();
        values.insert("k".to_string(), Value::from(k));
        values.insert("v".to_string(), Value::Int64(v));
        TableRow::new(schema(), values).unwrap()
    }

    #[tokio::test]
    async fn test_copy_block_is_terminated() {
        let buf = SharedBuf::default();
        let emitter = StdoutEmitter::with_writer(Box::new(buf.clone()));

        let written = emitter.bulk_load(&schema(), &[row("a", 1), row("b", 2)]).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            buf.text(),
            "COPY \"public\".\"t\" (\"k\", \"v\") FROM STDIN;\na\t1\nb\t2\n\\.\n"
        );
    }

    #[tokio::test]
    async fn test_upsert_and_delete_use_literals() {
        let buf = SharedBuf::default();
        let emitter = StdoutEmitter::with_writer(Box::new(buf.clone()));

        let r = row("it's", 7);
        emitter.upsert(&r).await.unwrap();
        emitter.delete(r.primary_key()).await.unwrap();

        let text = buf.text();
        assert!(text.contains("VALUES ('it''s', 7)"));
        assert!(text.contains("DELETE FROM \"public\".\"t\" WHERE \"k\" = 'it''s';"));
    }

    #[tokio::test]
    async fn test_closed_emitter_rejects_writes() {
        let emitter = StdoutEmitter::with_writer(Box::new(SharedBuf::default()));
        emitter.close().await.unwrap();
        emitter.close().await.unwrap();
        assert!(matches!(emitter.upsert(&row("a", 1)).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_fetch_schema_reports_nothing() {
        let emitter = StdoutEmitter::with_writer(Box::new(SharedBuf::default()));
        assert!(emitter.fetch_schema("t", "public").await.unwrap().is_none());
        assert!(!emitter.supports_distribution().await.unwrap());
    }
}
