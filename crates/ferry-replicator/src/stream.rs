//! Change-stream consumption
//!
//! A [`StreamConsumer`] keeps discovering the shards of one table's stream,
//! leases every shard it is allowed to process, and applies each shard's
//! records to the sink in sequence order:
//!
//! ```text
//!   discovery loop ──► eligible shard? ──► try_acquire lease ──► shard task
//!        ▲                                                          │
//!        └──────────── shard finished (children become eligible) ◄──┘
//! ```
//!
//! A child shard only becomes eligible once its parent is finished (or the
//! parent is no longer retained), so changes to one key are never applied
//! out of order across a shard split. Shard tasks renew their lease at the
//! heartbeat interval and checkpoint the last applied sequence number at the
//! checkpoint interval, on shard end and on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ReplicationError, Result};
use crate::lease::{Checkpoint, LeaseManager, ShardLease};
use crate::live_schema::LiveSchema;
use crate::retry::{retry, RetryConfig};
use crate::router::SinkRouter;
use crate::source::{
    ChangeKind, ChangeRecord, IteratorPosition, SequenceNumber, ShardDescriptor, ShardIterator,
    SourceStore,
};
use crate::translator::SchemaTranslator;

/// Timing and batching of stream consumption
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Records requested per poll
    pub poll_limit: u32,
    /// Pause after an empty poll
    pub idle_poll: Duration,
    /// Checkpoint at most this often while records flow
    pub checkpoint_interval: Duration,
    /// Renew leases this often
    pub heartbeat_interval: Duration,
    /// Look for new shards this often
    pub discovery_interval: Duration,
    /// Backoff for throttled or transient source calls
    pub retry: RetryConfig,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_limit: 1000,
            idle_poll: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            discovery_interval: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Totals reported when the consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Records applied to the sink
    pub records: u64,
    /// Shards drained to their end
    pub shards_finished: u64,
}

/// How a shard task ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardExit {
    /// Closed shard drained and marked finished
    Finished,
    /// Another worker took the lease
    LeaseLost,
    /// Shutdown requested
    Stopped,
}

struct ShardContext {
    table: String,
    stream_id: String,
    options: StreamOptions,
    source: Arc<dyn SourceStore>,
    router: Arc<SinkRouter>,
    translator: Arc<SchemaTranslator>,
    live: Arc<LiveSchema>,
    leases: LeaseManager,
    records: AtomicU64,
}

/// Applies one table's change stream to the sink
pub struct StreamConsumer {
    ctx: Arc<ShardContext>,
}

impl StreamConsumer {
    /// Create a consumer; the sink table must already exist
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: impl Into<String>,
        stream_id: impl Into<String>,
        options: StreamOptions,
        source: Arc<dyn SourceStore>,
        router: Arc<SinkRouter>,
        translator: Arc<SchemaTranslator>,
        live: Arc<LiveSchema>,
        leases: LeaseManager,
    ) -> Self {
        Self {
            ctx: Arc::new(ShardContext {
                table: table.into(),
                stream_id: stream_id.into(),
                options,
                source,
                router,
                translator,
                live,
                leases,
                records: AtomicU64::new(0),
            }),
        }
    }

    /// Records applied so far
    pub fn records_applied(&self) -> u64 {
        self.ctx.records.load(Ordering::Relaxed)
    }

    /// Consume until `cancel` fires or a shard fails.
    ///
    /// On a shard failure every other shard task is stopped (checkpointing
    /// and releasing its lease) and the failure is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<StreamSummary> {
        let ctx = &self.ctx;
        let shard_cancel = cancel.child_token();
        let mut tasks: JoinSet<(String, Result<ShardExit>)> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut summary = StreamSummary::default();
        let mut failure: Option<ReplicationError> = None;

        info!(
            table = %ctx.table,
            stream = %ctx.stream_id,
            worker = %ctx.leases.worker_id(),
            "Starting stream consumer"
        );

        loop {
            match self.discover(&running, &cancel).await {
                Ok(acquired) => {
                    for lease in acquired {
                        running.insert(lease.shard_id.clone());
                        let ctx = ctx.clone();
                        let cancel = shard_cancel.clone();
                        tasks.spawn(async move {
                            let shard_id = lease.shard_id.clone();
                            let result = process_shard(&ctx, lease, cancel).await;
                            (shard_id, result)
                        });
                    }
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((shard_id, Ok(exit))) => {
                            running.remove(&shard_id);
                            if exit == ShardExit::Finished {
                                summary.shards_finished += 1;
                            }
                            debug!(shard = %shard_id, ?exit, "Shard task ended");
                        }
                        Ok((shard_id, Err(e))) => {
                            error!(shard = %shard_id, error = %e, "Shard processing failed");
                            failure = Some(e);
                            break;
                        }
                        Err(e) => {
                            failure = Some(e.into());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(ctx.options.discovery_interval) => {}
            }
        }

        // stop the remaining shards; each checkpoints and releases its lease
        shard_cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ShardExit::Finished))) => summary.shards_finished += 1,
                Ok((_, Ok(_))) => {}
                Ok((shard_id, Err(e))) => {
                    if !e.is_cancelled() {
                        warn!(shard = %shard_id, error = %e, "Shard failed during shutdown");
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e.into());
                    }
                }
            }
        }

        summary.records = self.records_applied();
        match failure {
            Some(e) => Err(e),
            None => {
                info!(
                    table = %ctx.table,
                    records = summary.records,
                    shards_finished = summary.shards_finished,
                    "Stream consumer stopped"
                );
                Ok(summary)
            }
        }
    }

    /// Lease every eligible shard not already running here
    async fn discover(
        &self,
        running: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ShardLease>> {
        let ctx = &self.ctx;
        let shards = retry(&ctx.options.retry, cancel, "list_shards", || {
            ctx.source.list_shards(&ctx.stream_id)
        })
        .await?;
        let finished: HashMap<String, bool> = retry(&ctx.options.retry, cancel, "list_leases", || {
            ctx.leases.store().list()
        })
        .await?
        .into_iter()
        .map(|l| (l.shard_id, l.finished))
        .collect();

        let mut acquired = Vec::new();
        for shard in &shards {
            if running.contains(&shard.shard_id)
                || finished.get(&shard.shard_id).copied().unwrap_or(false)
                || !is_eligible(shard, &shards, &finished)
            {
                continue;
            }
            let lease = retry(&ctx.options.retry, cancel, "acquire_lease", || {
                ctx.leases.try_acquire(&shard.shard_id)
            })
            .await?;
            if let Some(lease) = lease {
                acquired.push(lease);
            }
        }
        if !acquired.is_empty() {
            debug!(
                stream = %ctx.stream_id,
                shards = shards.len(),
                acquired = acquired.len(),
                "Shard discovery"
            );
        }
        Ok(acquired)
    }
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("table", &self.ctx.table)
            .field("stream_id", &self.ctx.stream_id)
            .field("leases", &self.ctx.leases)
            .finish()
    }
}

/// A shard may start once its parent is finished or no longer listed
fn is_eligible(
    shard: &ShardDescriptor,
    shards: &[ShardDescriptor],
    finished: &HashMap<String, bool>,
) -> bool {
    match &shard.parent_shard_id {
        None => true,
        Some(parent) => {
            finished.get(parent).copied().unwrap_or(false)
                || !shards.iter().any(|s| &s.shard_id == parent)
        }
    }
}

fn start_position(after: Option<&SequenceNumber>) -> IteratorPosition {
    match after {
        Some(seq) => IteratorPosition::AfterSequence(seq.clone()),
        None => IteratorPosition::TrimHorizon,
    }
}

async fn open_iterator(
    ctx: &ShardContext,
    shard_id: &str,
    after: Option<&SequenceNumber>,
    cancel: &CancellationToken,
) -> Result<ShardIterator> {
    let position = start_position(after);
    retry(&ctx.options.retry, cancel, "shard_iterator", || {
        ctx.source
            .shard_iterator(&ctx.stream_id, shard_id, position.clone())
    })
    .await
}

async fn apply(ctx: &ShardContext, record: &ChangeRecord) -> Result<()> {
    match record.kind {
        ChangeKind::Insert | ChangeKind::Modify => {
            let image = record.new_image.as_ref().ok_or_else(|| {
                ReplicationError::source(format!(
                    "{} record {} of {} carries no new image",
                    record.kind, record.sequence, ctx.table
                ))
            })?;
            let row = ctx.live.materialize(&ctx.translator, image, &ctx.router).await?;
            ctx.router.upsert(&row).await
        }
        ChangeKind::Remove => {
            let key = ctx.translator.key_of(&record.keys, ctx.live.snapshot())?;
            ctx.router.delete(&key).await
        }
    }
}

async fn checkpoint_lease(
    ctx: &ShardContext,
    lease: &ShardLease,
    checkpoint: Checkpoint,
    cancel: &CancellationToken,
) -> Result<Option<ShardLease>> {
    retry(&ctx.options.retry, cancel, "checkpoint_lease", || {
        ctx.leases.checkpoint(lease, checkpoint.clone())
    })
    .await
}

async fn release_lease(
    ctx: &ShardContext,
    lease: &ShardLease,
    cancel: &CancellationToken,
) -> Result<()> {
    retry(&ctx.options.retry, cancel, "release_lease", || {
        ctx.leases.release(lease)
    })
    .await
}

/// Checkpoint what was applied and hand the lease back
async fn stop_shard(
    ctx: &ShardContext,
    lease: ShardLease,
    applied: Option<SequenceNumber>,
    checkpointed: Option<SequenceNumber>,
) -> Result<ShardExit> {
    // the shard token is already cancelled; shutdown writes still retry
    let shutdown = CancellationToken::new();
    let mut lease = lease;
    if let Some(seq) = applied.filter(|s| Some(s) != checkpointed.as_ref()) {
        match checkpoint_lease(ctx, &lease, Checkpoint::Sequence(seq), &shutdown).await? {
            Some(updated) => lease = updated,
            None => return Ok(ShardExit::LeaseLost),
        }
    }
    release_lease(ctx, &lease, &shutdown).await?;
    Ok(ShardExit::Stopped)
}

async fn process_shard(
    ctx: &ShardContext,
    lease: ShardLease,
    cancel: CancellationToken,
) -> Result<ShardExit> {
    let shard_id = lease.shard_id.clone();
    let mut lease = lease;
    let mut applied: Option<SequenceNumber> = lease.resume_after().cloned();
    let mut checkpointed = applied.clone();
    info!(
        shard = %shard_id,
        resume_after = ?applied,
        "Processing shard"
    );

    let mut iterator = match open_iterator(ctx, &shard_id, applied.as_ref(), &cancel).await {
        Ok(it) => it,
        Err(e) if e.is_cancelled() => return stop_shard(ctx, lease, applied, checkpointed).await,
        Err(e) => return Err(e),
    };
    let mut last_checkpoint = Instant::now();
    let mut last_renewal = Instant::now();
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return stop_shard(ctx, lease, applied, checkpointed).await;
        }

        let batch = match ctx
            .source
            .get_records(&iterator, ctx.options.poll_limit)
            .await
        {
            Ok(batch) => {
                failures = 0;
                batch
            }
            Err(e) if e.is_retriable() && ctx.options.retry.should_retry(failures) => {
                let delay = ctx.options.retry.delay_for_attempt(failures);
                failures += 1;
                warn!(
                    shard = %shard_id,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Polling shard failed; reopening iterator"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return stop_shard(ctx, lease, applied, checkpointed).await;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                iterator = match open_iterator(ctx, &shard_id, applied.as_ref(), &cancel).await {
                    Ok(it) => it,
                    Err(e) if e.is_cancelled() => {
                        return stop_shard(ctx, lease, applied, checkpointed).await
                    }
                    Err(e) => return Err(e),
                };
                continue;
            }
            Err(e) => return Err(e),
        };

        let idle = batch.records.is_empty();
        for record in &batch.records {
            apply(ctx, record).await?;
            applied = Some(record.sequence.clone());
            ctx.records.fetch_add(1, Ordering::Relaxed);
        }

        let Some(next) = batch.next_iterator else {
            let Some(done) = checkpoint_lease(ctx, &lease, Checkpoint::ShardEnd, &cancel).await?
            else {
                warn!(shard = %shard_id, "Lost lease before marking shard finished");
                return Ok(ShardExit::LeaseLost);
            };
            release_lease(ctx, &done, &cancel).await?;
            info!(shard = %shard_id, "Shard finished");
            return Ok(ShardExit::Finished);
        };
        iterator = next;

        let due_checkpoint = applied != checkpointed
            && last_checkpoint.elapsed() >= ctx.options.checkpoint_interval;
        let due_renewal = last_renewal.elapsed() >= ctx.options.heartbeat_interval;
        if due_checkpoint || due_renewal {
            let updated = match (&applied, due_checkpoint) {
                (Some(seq), true) => {
                    checkpoint_lease(ctx, &lease, Checkpoint::Sequence(seq.clone()), &cancel).await
                }
                _ => {
                    retry(&ctx.options.retry, &cancel, "renew_lease", || {
                        ctx.leases.renew(&lease)
                    })
                    .await
                }
            };
            let updated = match updated {
                Ok(updated) => updated,
                Err(e) if e.is_cancelled() => {
                    return stop_shard(ctx, lease, applied, checkpointed).await
                }
                Err(e) => return Err(e),
            };
            match updated {
                Some(updated) => lease = updated,
                None => {
                    warn!(shard = %shard_id, "Shard lease taken over; stopping");
                    return Ok(ShardExit::LeaseLost);
                }
            }
            if due_checkpoint {
                checkpointed = applied.clone();
                last_checkpoint = Instant::now();
            }
            last_renewal = Instant::now();
        }

        if idle {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(ctx.options.idle_poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str, parent: Option<&str>) -> ShardDescriptor {
        let s = ShardDescriptor::new(id);
        match parent {
            Some(p) => s.with_parent(p),
            None => s,
        }
    }

    #[test]
    fn test_root_shard_is_eligible() {
        let shards = vec![shard("a", None)];
        assert!(is_eligible(&shards[0], &shards, &HashMap::new()));
    }

    #[test]
    fn test_child_waits_for_parent() {
        let shards = vec![shard("a", None), shard("b", Some("a"))];
        let mut finished = HashMap::new();
        assert!(!is_eligible(&shards[1], &shards, &finished));

        finished.insert("a".to_string(), false);
        assert!(!is_eligible(&shards[1], &shards, &finished));

        finished.insert("a".to_string(), true);
        assert!(is_eligible(&shards[1], &shards, &finished));
    }

    #[test]
    fn test_child_of_trimmed_parent_is_eligible() {
        let shards = vec![shard("b", Some("gone"))];
        assert!(is_eligible(&shards[0], &shards, &HashMap::new()));
    }

    #[test]
    fn test_start_position() {
        assert_eq!(start_position(None), IteratorPosition::TrimHorizon);
        let seq = SequenceNumber::from(100u64);
        assert_eq!(
            start_position(Some(&seq)),
            IteratorPosition::AfterSequence(seq.clone())
        );
    }
}
