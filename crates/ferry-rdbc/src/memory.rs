//! In-memory emitter
//!
//! [`MemoryDatabase`] is a tiny table store shared by any number of
//! [`MemoryEmitter`]s, one per router worker. Every successful write is
//! appended to a journal tagged with the worker that performed it, so tests
//! can check ordering and placement. Failures can be injected per operation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::emitter::TableEmitter;
use crate::error::{Error, Result};
use crate::schema::{PrimaryKeyValue, TableColumn, TableRow, TableSchema};
use crate::types::Value;

/// Kind of emitter operation, as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_table`
    CreateTable,
    /// `create_column`
    CreateColumn,
    /// One row of a `bulk_load`
    BulkLoad,
    /// `upsert`
    Upsert,
    /// `delete`
    Delete,
    /// `close`
    Close,
}

/// One journal entry
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Worker index of the emitter
    pub worker: usize,
    /// Operation performed
    pub operation: Operation,
    /// Qualified table name (empty for `close`)
    pub table: String,
    /// Rendered primary key for row operations
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    key: Vec<Value>,
    values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<Vec<u8>, StoredRow>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    journal: Vec<JournalEntry>,
    failures: HashMap<Operation, VecDeque<Error>>,
}

/// Shared in-memory table store
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
    distribution: Arc<AtomicBool>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Report native distribution support to emitters
    pub fn set_distribution(&self, enabled: bool) {
        self.distribution.store(enabled, Ordering::Release);
    }

    /// Create an emitter bound to `worker`
    pub fn emitter(&self, worker: usize) -> MemoryEmitter {
        MemoryEmitter {
            db: self.clone(),
            worker,
            closed: AtomicBool::new(false),
        }
    }

    /// Make the next `op` fail with `error`; queued failures fire in order
    pub fn fail_next(&self, op: Operation, error: Error) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Install a table directly, bypassing the journal
    pub fn insert_table(&self, schema: TableSchema) {
        self.state.lock().tables.insert(
            schema.qualified_name(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Current schema of `qualified` (`namespace.table`)
    pub fn schema(&self, qualified: &str) -> Option<TableSchema> {
        self.state
            .lock()
            .tables
            .get(qualified)
            .map(|t| t.schema.clone())
    }

    /// Names of all tables
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of rows in `qualified`
    pub fn row_count(&self, qualified: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(qualified)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// All rows of `qualified`, every schema column present (NULL when unset)
    pub fn rows(&self, qualified: &str) -> Vec<BTreeMap<String, Value>> {
        let state = self.state.lock();
        let Some(table) = state.tables.get(qualified) else {
            return Vec::new();
        };
        table
            .rows
            .values()
            .map(|row| {
                table
                    .schema
                    .columns()
                    .iter()
                    .map(|c| {
                        let value = row.values.get(&c.name).cloned().unwrap_or(Value::Null);
                        (c.name.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }

    /// Row of `qualified` whose primary key equals `key` (values in key order)
    pub fn row(&self, qualified: &str, key: &[Value]) -> Option<BTreeMap<String, Value>> {
        self.rows(qualified).into_iter().find(|row| {
            let schema = self.schema(qualified);
            schema.is_some_and(|s| {
                s.primary_key()
                    .iter()
                    .zip(key)
                    .all(|(k, v)| row.get(k).is_some_and(|stored| stored == v))
            })
        })
    }

    /// Snapshot of the journal
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    fn take_failure(state: &mut State, op: Operation) -> Option<Error> {
        state.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("tables", &self.table_names())
            .finish()
    }
}

/// Emitter backed by a [`MemoryDatabase`]
pub struct MemoryEmitter {
    db: MemoryDatabase,
    worker: usize,
    closed: AtomicBool,
}

impl MemoryEmitter {
    /// Worker index this emitter was created for
    pub fn worker(&self) -> usize {
        self.worker
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn record(&self, state: &mut State, operation: Operation, table: String, key: Option<String>) {
        state.journal.push(JournalEntry {
            worker: self.worker,
            operation,
            table,
            key,
        });
    }
}

fn compare_keys(a: &[Value], b: &[Value]) -> CmpOrdering {
    for (x, y) in a.iter().zip(b) {
        match x.partial_cmp(y) {
            Some(CmpOrdering::Equal) | None => continue,
            Some(ord) => return ord,
        }
    }
    CmpOrdering::Equal
}

#[async_trait]
impl TableEmitter for MemoryEmitter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_schema(&self, table: &str, namespace: &str) -> Result<Option<TableSchema>> {
        self.check_open()?;
        Ok(self.db.schema(&format!("{}.{}", namespace, table)))
    }

    async fn supports_distribution(&self) -> Result<bool> {
        Ok(self.db.distribution.load(Ordering::Acquire))
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        self.check_open()?;
        schema.validate()?;
        let mut state = self.db.state.lock();
        if let Some(err) = MemoryDatabase::take_failure(&mut state, Operation::CreateTable) {
            return Err(err);
        }
        let qualified = schema.qualified_name();
        if state.tables.contains_key(&qualified) {
            return Err(Error::table_exists(qualified));
        }
        state.tables.insert(
            qualified.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: BTreeMap::new(),
            },
        );
        self.record(&mut state, Operation::CreateTable, qualified, None);
        Ok(())
    }

    async fn create_column(&self, schema: &TableSchema, column: &TableColumn) -> Result<()> {
        self.check_open()?;
        let mut state = self.db.state.lock();
        if let Some(err) = MemoryDatabase::take_failure(&mut state, Operation::CreateColumn) {
            return Err(err);
        }
        let qualified = schema.qualified_name();
        let table = state
            .tables
            .get_mut(&qualified)
            .ok_or_else(|| Error::table_not_found(qualified.clone()))?;
        let mut column = column.clone();
        column.nullable = true;
        if table.schema.add_column(column)? {
            self.record(&mut state, Operation::CreateColumn, qualified, None);
        }
        Ok(())
    }

    async fn bulk_load(&self, schema: &TableSchema, rows: &[TableRow]) -> Result<u64> {
        self.check_open()?;
        let mut state = self.db.state.lock();
        if let Some(err) = MemoryDatabase::take_failure(&mut state, Operation::BulkLoad) {
            return Err(err);
        }
        let qualified = schema.qualified_name();
        let table = state
            .tables
            .get_mut(&qualified)
            .ok_or_else(|| Error::table_not_found(qualified.clone()))?;

        // COPY is all-or-nothing
        let mut staged = table.rows.clone();
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.primary_key();
            let bytes = key.key_bytes();
            if staged.contains_key(&bytes) {
                return Err(Error::constraint(
                    format!("{}_pkey", schema.name),
                    format!("duplicate key {}", key),
                ));
            }
            staged.insert(
                bytes,
                StoredRow {
                    key: key.values().to_vec(),
                    values: row.values().clone(),
                },
            );
            keys.push(key.to_string());
        }
        table.rows = staged;
        for key in keys {
            self.record(&mut state, Operation::BulkLoad, qualified.clone(), Some(key));
        }
        Ok(rows.len() as u64)
    }

    async fn upsert(&self, row: &TableRow) -> Result<()> {
        self.check_open()?;
        let mut state = self.db.state.lock();
        if let Some(err) = MemoryDatabase::take_failure(&mut state, Operation::Upsert) {
            return Err(err);
        }
        let qualified = row.schema().qualified_name();
        let table = state
            .tables
            .get_mut(&qualified)
            .ok_or_else(|| Error::table_not_found(qualified.clone()))?;
        for column in row.values().keys() {
            if !table.schema.has_column(column) {
                return Err(Error::query(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    column, qualified
                )));
            }
        }
        let key = row.primary_key();
        table.rows.insert(
            key.key_bytes(),
            StoredRow {
                key: key.values().to_vec(),
                values: row.values().clone(),
            },
        );
        self.record(&mut state, Operation::Upsert, qualified, Some(key.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &PrimaryKeyValue) -> Result<()> {
        self.check_open()?;
        let mut state = self.db.state.lock();
        if let Some(err) = MemoryDatabase::take_failure(&mut state, Operation::Delete) {
            return Err(err);
        }
        let qualified = key.schema().qualified_name();
        let table = state
            .tables
            .get_mut(&qualified)
            .ok_or_else(|| Error::table_not_found(qualified.clone()))?;
        table.rows.remove(&key.key_bytes());
        self.record(&mut state, Operation::Delete, qualified, Some(key.to_string()));
        Ok(())
    }

    async fn max_primary_key(&self, schema: &TableSchema) -> Result<Option<PrimaryKeyValue>> {
        self.check_open()?;
        let state = self.db.state.lock();
        let qualified = schema.qualified_name();
        let table = state
            .tables
            .get(&qualified)
            .ok_or_else(|| Error::table_not_found(qualified.clone()))?;
        let max = table
            .rows
            .values()
            .max_by(|a, b| compare_keys(&a.key, &b.key))
            .map(|row| row.key.clone());
        drop(state);

        match max {
            Some(values) => PrimaryKeyValue::new(Arc::new(schema.clone()), values).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.db.state.lock();
        if let Some(err) = MemoryDatabase::take_failure(&mut state, Operation::Close) {
            return Err(err);
        }
        self.record(&mut state, Operation::Close, String::new(), None);
        Ok(())
    }
}
