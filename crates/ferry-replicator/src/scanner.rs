//! Rate-limited parallel table scan
//!
//! The table is split into N segments, read page by page by at most
//! `max_parallel` concurrent tasks. Every page first acquires, from a bucket
//! shared by all segments, as many read units as the previous page of the
//! same segment consumed. Pages are written with COPY while the sink table
//! started out empty, and with upserts otherwise so resumed or repeated
//! loads converge instead of failing on duplicate keys.
//!
//! After the first segment failure no further segments start; segments
//! already running finish, then the first error is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ReplicationError, Result};
use crate::live_schema::LiveSchema;
use crate::progress::{ProgressStore, SegmentProgress};
use crate::rate_limiter::{RateLimitConfig, ReadCapacityLimiter};
use crate::retry::{retry, RetryConfig};
use crate::router::SinkRouter;
use crate::source::{ContinuationToken, ScanRequest, SourceStore};
use crate::translator::SchemaTranslator;

/// How a table scan is split and paced
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Number of segments (N)
    pub total_segments: u32,
    /// Segments scanned at the same time
    pub max_parallel: usize,
    /// Items per page requested from the source
    pub page_limit: Option<u32>,
    /// Read units per second shared by all segments
    pub rate_limit: RateLimitConfig,
    /// Backoff for throttled or transient source calls
    pub retry: RetryConfig,
    /// Write through per-key upserts even into an empty table
    pub use_upsert: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            total_segments: 16,
            max_parallel: 16,
            page_limit: None,
            rate_limit: RateLimitConfig::new(25),
            retry: RetryConfig::default(),
            use_upsert: false,
        }
    }
}

/// Outcome of a finished scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Rows written by all segments, including rows from earlier runs
    pub rows: u64,
    /// Pages read in this run
    pub pages: u64,
    /// Segments that were already finished by an earlier run
    pub segments_resumed: u32,
    /// Whether rows went through COPY
    pub bulk: bool,
}

/// Everything a segment task needs
struct SegmentContext {
    table: String,
    options: ScanOptions,
    source: Arc<dyn SourceStore>,
    router: Arc<SinkRouter>,
    translator: Arc<SchemaTranslator>,
    live: Arc<LiveSchema>,
    progress: Arc<dyn ProgressStore>,
    limiter: ReadCapacityLimiter,
    bulk: bool,
    failed: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SegmentOutcome {
    rows: u64,
    pages: u64,
}

/// Scans one source table into the sink
pub struct SegmentedScanner {
    table: String,
    options: ScanOptions,
    source: Arc<dyn SourceStore>,
    router: Arc<SinkRouter>,
    translator: Arc<SchemaTranslator>,
    live: Arc<LiveSchema>,
    progress: Arc<dyn ProgressStore>,
}

impl SegmentedScanner {
    /// Create a scanner for `table`, whose sink table already exists
    pub fn new(
        table: impl Into<String>,
        options: ScanOptions,
        source: Arc<dyn SourceStore>,
        router: Arc<SinkRouter>,
        translator: Arc<SchemaTranslator>,
        live: Arc<LiveSchema>,
        progress: Arc<dyn ProgressStore>,
    ) -> Result<Self> {
        if options.total_segments == 0 {
            return Err(ReplicationError::argument("scan needs at least one segment"));
        }
        if options.max_parallel == 0 {
            return Err(ReplicationError::argument(
                "scan needs at least one concurrent segment",
            ));
        }
        Ok(Self {
            table: table.into(),
            options,
            source,
            router,
            translator,
            live,
            progress,
        })
    }

    /// Scan every segment; returns once all segments finished, one failed
    /// (after the running ones complete), or `cancel` fired.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ScanSummary> {
        let total = self.options.total_segments;
        let saved = match self.progress.load(&self.table).await? {
            Some(scan) if scan.total_segments == total => Some(scan),
            Some(scan) => {
                warn!(
                    table = %self.table,
                    saved_segments = scan.total_segments,
                    segments = total,
                    "Segment count changed; discarding scan progress"
                );
                self.progress.clear(&self.table).await?;
                None
            }
            None => None,
        };

        let empty = self
            .router
            .max_primary_key(&self.live.snapshot())
            .await?
            .is_none();
        let bulk = empty && saved.is_none() && !self.options.use_upsert;
        info!(
            table = %self.table,
            segments = total,
            parallel = self.options.max_parallel,
            bulk,
            "Starting table scan"
        );

        let ctx = Arc::new(SegmentContext {
            table: self.table.clone(),
            options: self.options.clone(),
            source: self.source.clone(),
            router: self.router.clone(),
            translator: self.translator.clone(),
            live: self.live.clone(),
            progress: self.progress.clone(),
            limiter: ReadCapacityLimiter::new(self.options.rate_limit.clone()),
            bulk,
            failed: AtomicBool::new(false),
            cancel,
        });
        let permits = Arc::new(Semaphore::new(self.options.max_parallel));

        let mut summary = ScanSummary {
            bulk,
            ..Default::default()
        };
        let mut tasks = JoinSet::new();
        for segment in 0..total {
            let resume = saved.as_ref().and_then(|s| s.segments.get(&segment)).cloned();
            if let Some(done) = resume.as_ref().filter(|p| p.finished) {
                summary.rows += done.rows;
                summary.segments_resumed += 1;
                continue;
            }
            let ctx = ctx.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Err(ReplicationError::internal("scan semaphore closed"));
                };
                if ctx.failed.load(Ordering::Acquire) {
                    debug!(table = %ctx.table, segment, "Skipping segment after failure");
                    return Ok(SegmentOutcome::default());
                }
                if ctx.cancel.is_cancelled() {
                    return Err(ReplicationError::Cancelled);
                }
                let result = scan_segment(&ctx, segment, resume).await;
                if result.is_err() {
                    ctx.failed.store(true, Ordering::Release);
                }
                result
            });
        }

        let mut first_error: Option<ReplicationError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(ReplicationError::from).and_then(|r| r) {
                Ok(outcome) => {
                    summary.rows += outcome.rows;
                    summary.pages += outcome.pages;
                }
                Err(e) => {
                    ctx.failed.store(true, Ordering::Release);
                    // a real failure outranks the cancellations it may cause
                    match &first_error {
                        None => first_error = Some(e),
                        Some(prev) if prev.is_cancelled() && !e.is_cancelled() => {
                            first_error = Some(e)
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        if let Some(e) = first_error {
            warn!(table = %self.table, error = %e, "Table scan failed");
            return Err(e);
        }
        info!(
            table = %self.table,
            rows = summary.rows,
            pages = summary.pages,
            limiter = %ctx.limiter.stats(),
            "Finished table scan"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for SegmentedScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedScanner")
            .field("table", &self.table)
            .field("options", &self.options)
            .finish()
    }
}

async fn scan_segment(
    ctx: &SegmentContext,
    segment: u32,
    resume: Option<SegmentProgress>,
) -> Result<SegmentOutcome> {
    let total = ctx.options.total_segments;
    let mut start: Option<ContinuationToken> = resume.as_ref().and_then(|p| p.next.clone());
    let mut rows = resume.as_ref().map_or(0, |p| p.rows);
    let mut outcome = SegmentOutcome::default();
    let mut last_units = 1.0f64;
    if start.is_some() {
        debug!(table = %ctx.table, segment, rows, "Resuming segment");
    }

    loop {
        ctx.limiter.acquire(last_units.ceil().max(1.0) as u64).await;

        let request = ScanRequest {
            table: ctx.table.clone(),
            segment,
            total_segments: total,
            start: start.clone(),
            limit: ctx.options.page_limit,
        };
        let page = retry(&ctx.options.retry, &ctx.cancel, "scan", || {
            ctx.source.scan(request.clone())
        })
        .await?;
        last_units = page.consumed_units;
        outcome.pages += 1;

        let mut batch = Vec::with_capacity(page.items.len());
        for item in &page.items {
            batch.push(ctx.live.materialize(&ctx.translator, item, &ctx.router).await?);
        }
        let written = if ctx.bulk {
            // rows built before a mid-page column addition get NULL for it
            ctx.router
                .bulk_load(segment as usize, &ctx.live.snapshot(), &batch)
                .await?
        } else {
            for row in &batch {
                ctx.router.upsert(row).await?;
            }
            batch.len() as u64
        };
        rows += written;

        ctx.progress
            .save_segment(
                &ctx.table,
                total,
                segment,
                SegmentProgress::after_page(rows, page.next.clone()),
            )
            .await?;

        match page.next {
            None => break,
            Some(next) => start = Some(next),
        }
        if ctx.cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
    }

    debug!(table = %ctx.table, segment, rows, "Segment finished");
    // rows from a previous run count toward the table total
    outcome.rows = rows;
    Ok(outcome)
}
