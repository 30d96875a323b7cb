//! Per-table replication phases
//!
//! A [`ReplicationCoordinator`] drives one source table through three
//! phases:
//!
//! 1. schema: derive the relational schema, create the sink table or add
//!    the columns it lacks
//! 2. data: rate-limited parallel scan of every item into the sink
//! 3. changes: consume the table's change stream until cancelled
//!
//! The change phase starts only after a successful data phase. Because the
//! stream is read from its oldest retained record, changes made during the
//! load are replayed over the loaded rows and converge on the latest image.
//!
//! The coordinator never closes the [`SinkRouter`]; its owner does.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{ReplicationError, Result, SchemaConflict};
use crate::lease::LeaseManager;
use crate::live_schema::LiveSchema;
use crate::progress::{MemoryProgressStore, ProgressStore};
use crate::rate_limiter::RateLimitConfig;
use crate::retry::retry;
use crate::router::SinkRouter;
use crate::scanner::{ScanOptions, SegmentedScanner};
use crate::source::{SourceStore, SourceTableDescription};
use crate::stream::{StreamConsumer, StreamOptions, StreamSummary};
use crate::translator::SchemaTranslator;

/// Tables to replicate: the filter if one is given, otherwise every source
/// table except lease tables.
pub async fn replicable_tables(
    source: &dyn SourceStore,
    filter: &[String],
    lease_prefix: &str,
) -> Result<Vec<String>> {
    let reserved = |name: &str| !lease_prefix.is_empty() && name.starts_with(lease_prefix);
    if !filter.is_empty() {
        if let Some(name) = filter.iter().find(|name| reserved(name)) {
            return Err(ReplicationError::argument(format!(
                "table {} is a lease table and cannot be replicated",
                name
            )));
        }
        return Ok(filter.to_vec());
    }
    let mut tables: Vec<String> = source
        .list_tables()
        .await?
        .into_iter()
        .filter(|name| !reserved(name))
        .collect();
    tables.sort();
    Ok(tables)
}

/// Load every table at once and return the total row count.
///
/// All loads start before any is awaited. The first failure cancels the
/// others and is returned after they stopped.
pub async fn replicate_all_data(
    coordinators: &[Arc<ReplicationCoordinator>],
    max_rate: u64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let loads = cancel.child_token();
    let mut tasks = JoinSet::new();
    for coordinator in coordinators {
        let handle = match coordinator.start_replicating_data(max_rate, loads.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                loads.cancel();
                while tasks.join_next().await.is_some() {}
                return Err(e);
            }
        };
        let table = coordinator.table().to_string();
        tasks.spawn(async move {
            let result = handle.await.map_err(ReplicationError::from).and_then(|r| r);
            (table, result)
        });
    }

    let mut total = 0u64;
    let mut failure: Option<ReplicationError> = None;
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        let (table, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                loads.cancel();
                if failure.is_none() {
                    failure = Some(e.into());
                }
                continue;
            }
        };
        match result {
            Ok(rows) => {
                info!(table = %table, rows, "Table loaded");
                total += rows;
            }
            Err(ReplicationError::Cancelled) => cancelled = true,
            Err(e) => {
                error!(table = %table, error = %e, "Data replication failed");
                loads.cancel();
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None if cancelled => Err(ReplicationError::Cancelled),
        None => {
            info!(tables = coordinators.len(), rows = total, "Data replication complete");
            Ok(total)
        }
    }
}

struct Prepared {
    description: SourceTableDescription,
    live: Arc<LiveSchema>,
}

/// Drives one table through schema, data and change replication
pub struct ReplicationCoordinator {
    table: String,
    source: Arc<dyn SourceStore>,
    router: Arc<SinkRouter>,
    translator: Arc<SchemaTranslator>,
    progress: Arc<dyn ProgressStore>,
    scan: ScanOptions,
    stream: StreamOptions,
    leases: Option<LeaseManager>,
    prepared: Mutex<Option<Arc<Prepared>>>,
    data_loaded: Arc<AtomicBool>,
}

impl ReplicationCoordinator {
    /// Create a coordinator with default scan and stream options
    pub fn new(
        table: impl Into<String>,
        source: Arc<dyn SourceStore>,
        router: Arc<SinkRouter>,
        translator: Arc<SchemaTranslator>,
    ) -> Self {
        Self {
            table: table.into(),
            source,
            router,
            translator,
            progress: Arc::new(MemoryProgressStore::new()),
            scan: ScanOptions::default(),
            stream: StreamOptions::default(),
            leases: None,
            prepared: Mutex::new(None),
            data_loaded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set scan options
    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.scan = options;
        self
    }

    /// Set stream options
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream = options;
        self
    }

    /// Persist scan progress in `store`
    pub fn with_progress_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.progress = store;
        self
    }

    /// Lease manager for change replication
    pub fn with_leases(mut self, leases: LeaseManager) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Source table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current sink schema, once the schema phase ran
    pub fn schema(&self) -> Option<Arc<LiveSchema>> {
        self.prepared.lock().as_ref().map(|p| p.live.clone())
    }

    /// Whether the data phase completed
    pub fn is_data_loaded(&self) -> bool {
        self.data_loaded.load(Ordering::Acquire)
    }

    /// Create or extend the sink table. Safe to repeat.
    pub async fn replicate_schema(&self) -> Result<Arc<LiveSchema>> {
        let never = CancellationToken::new();
        let description = retry(&self.scan.retry, &never, "describe_table", || {
            self.source.describe_table(&self.table)
        })
        .await?;
        let distribute = self.router.supports_distribution().await?;
        let desired = self.translator.derive_schema(&description, distribute)?;
        let namespace = self.translator.namespace();

        let existing = self.router.fetch_schema(&desired.name, namespace).await?;
        let schema = match existing {
            None => match self.router.create_table(&desired).await {
                Ok(()) => {
                    info!(
                        table = %desired.qualified_name(),
                        columns = desired.columns().len(),
                        distributed = desired.distribution_column.is_some(),
                        "Created sink table"
                    );
                    desired
                }
                // another process created it first
                Err(ReplicationError::SchemaConflict(SchemaConflict::TableExists { .. })) => {
                    let existing = self
                        .router
                        .fetch_schema(&desired.name, namespace)
                        .await?
                        .ok_or_else(|| {
                            ReplicationError::from(SchemaConflict::TableMissing {
                                table: desired.qualified_name(),
                            })
                        })?;
                    self.extend(existing, &desired).await?
                }
                Err(e) => return Err(e),
            },
            Some(existing) => self.extend(existing, &desired).await?,
        };

        let live = Arc::new(LiveSchema::new(schema));
        *self.prepared.lock() = Some(Arc::new(Prepared {
            description,
            live: live.clone(),
        }));
        Ok(live)
    }

    async fn extend(
        &self,
        mut existing: ferry_rdbc::TableSchema,
        desired: &ferry_rdbc::TableSchema,
    ) -> Result<ferry_rdbc::TableSchema> {
        let missing = self.translator.reconcile(&existing, desired)?;
        for column in &missing {
            self.router.create_column(&existing, column).await?;
            existing.add_column(column.clone())?;
        }
        info!(
            table = %existing.qualified_name(),
            added = missing.len(),
            "Sink table up to date"
        );
        Ok(existing)
    }

    fn prepared(&self) -> Result<Arc<Prepared>> {
        self.prepared.lock().clone().ok_or_else(|| {
            ReplicationError::internal(format!(
                "schema of {} must be replicated before its data",
                self.table
            ))
        })
    }

    /// Start the bulk load in the background.
    ///
    /// `max_rate` caps read units per second for this table (0 = unlimited).
    /// The handle yields the number of rows written, counting resumed segments.
    pub fn start_replicating_data(
        &self,
        max_rate: u64,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<u64>>> {
        let prepared = self.prepared()?;
        let mut options = self.scan.clone();
        options.rate_limit = RateLimitConfig::new(max_rate);
        let scanner = SegmentedScanner::new(
            self.table.clone(),
            options,
            self.source.clone(),
            self.router.clone(),
            self.translator.clone(),
            prepared.live.clone(),
            self.progress.clone(),
        )?;
        let loaded = self.data_loaded.clone();
        let table = self.table.clone();

        Ok(tokio::spawn(async move {
            let summary = scanner.run(cancel).await?;
            loaded.store(true, Ordering::Release);
            info!(table = %table, rows = summary.rows, "Data replication complete");
            Ok(summary.rows)
        }))
    }

    /// Start consuming the change stream in the background until `cancel`
    /// fires. Requires a completed data phase and a lease manager.
    pub fn start_replicating_changes(
        &self,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<StreamSummary>>> {
        let prepared = self.prepared()?;
        if !self.is_data_loaded() {
            return Err(ReplicationError::internal(format!(
                "changes of {} can only be replicated after its data",
                self.table
            )));
        }
        let stream_id = prepared.description.stream_id.clone().ok_or_else(|| {
            ReplicationError::argument(format!("table {} has no change stream", self.table))
        })?;
        let leases = self.leases.clone().ok_or_else(|| {
            ReplicationError::argument("change replication needs a lease store")
        })?;

        let consumer = StreamConsumer::new(
            self.table.clone(),
            stream_id,
            self.stream.clone(),
            self.source.clone(),
            self.router.clone(),
            self.translator.clone(),
            prepared.live.clone(),
            leases.clone(),
        );
        Ok(tokio::spawn(async move {
            leases.store().ensure_table().await?;
            consumer.run(cancel).await
        }))
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("table", &self.table)
            .field("data_loaded", &self.is_data_loaded())
            .finish()
    }
}
