//! Shard leases and checkpoints
//!
//! Each stream shard is processed by at most one worker at a time. A worker
//! holds a shard through a lease with an expiry; every change to a lease
//! bumps its counter and is written with a compare-and-set on the counter
//! it read, so two workers can never both believe they own a shard.
//!
//! The lease also carries the shard's checkpoint: the sequence number of
//! the last record applied to the sink, or [`Checkpoint::ShardEnd`] once a
//! closed shard was drained. Checkpoints only move forward.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ReplicationError, Result};
use crate::source::SequenceNumber;

/// Last applied position of a shard
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "sequence", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Records up to and including this sequence number were applied
    Sequence(SequenceNumber),
    /// Every record of a closed shard was applied
    ShardEnd,
}

/// Ownership and progress record of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLease {
    /// Shard identifier
    pub shard_id: String,
    /// Worker holding the lease
    pub owner: Option<String>,
    /// Last checkpoint
    pub checkpoint: Option<Checkpoint>,
    /// Shard fully processed
    pub finished: bool,
    /// Lease is free for takeover after this instant
    pub expires_at: DateTime<Utc>,
    /// Bumped on every write
    pub counter: u64,
}

impl ShardLease {
    /// Whether the lease has run out at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `worker` may take the lease at `now`
    pub fn is_available_to(&self, worker: &str, now: DateTime<Utc>) -> bool {
        !self.finished
            && match &self.owner {
                None => true,
                Some(owner) if owner == worker => true,
                Some(_) => self.is_expired_at(now),
            }
    }

    /// Sequence number to resume after, if any
    pub fn resume_after(&self) -> Option<&SequenceNumber> {
        match &self.checkpoint {
            Some(Checkpoint::Sequence(seq)) => Some(seq),
            _ => None,
        }
    }
}

/// Durable lease storage with conditional writes
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the backing table if it does not exist
    async fn ensure_table(&self) -> Result<()>;

    /// Lease of one shard
    async fn get(&self, shard_id: &str) -> Result<Option<ShardLease>>;

    /// Every lease
    async fn list(&self) -> Result<Vec<ShardLease>>;

    /// Write `lease` if the stored counter equals `expected_counter`
    /// (`None`: only if no lease exists). Returns false when the condition
    /// failed.
    async fn compare_and_set(&self, expected_counter: Option<u64>, lease: ShardLease)
        -> Result<bool>;
}

/// Leases kept in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<BTreeMap<String, ShardLease>>>,
    failures: Arc<Mutex<VecDeque<ReplicationError>>>,
}

impl MemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a lease look abandoned (its owner stopped renewing)
    pub fn force_expire(&self, shard_id: &str) {
        if let Some(lease) = self.leases.lock().get_mut(shard_id) {
            lease.expires_at = DateTime::<Utc>::default();
        }
    }

    /// Fail the next store call, of any kind, with `error`
    pub fn fail_next(&self, error: ReplicationError) {
        self.failures.lock().push_back(error);
    }

    /// Injected failures not yet returned
    pub fn pending_failures(&self) -> usize {
        self.failures.lock().len()
    }

    fn enter(&self) -> Result<()> {
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, shard_id: &str) -> Result<Option<ShardLease>> {
        self.enter()?;
        Ok(self.leases.lock().get(shard_id).cloned())
    }

    async fn list(&self) -> Result<Vec<ShardLease>> {
        self.enter()?;
        Ok(self.leases.lock().values().cloned().collect())
    }

    async fn compare_and_set(
        &self,
        expected_counter: Option<u64>,
        lease: ShardLease,
    ) -> Result<bool> {
        self.enter()?;
        let mut leases = self.leases.lock();
        let current = leases.get(&lease.shard_id).map(|l| l.counter);
        if current != expected_counter {
            return Ok(false);
        }
        leases.insert(lease.shard_id.clone(), lease);
        Ok(true)
    }
}

/// Lease operations on behalf of one worker
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    worker_id: String,
    ttl: Duration,
}

impl LeaseManager {
    /// Create a manager for `worker_id` with leases lasting `ttl`
    pub fn new(store: Arc<dyn LeaseStore>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            ttl,
        }
    }

    /// This worker's identifier
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Lease duration
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    fn expiry(&self) -> Result<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ReplicationError::argument(format!("lease ttl out of range: {}", e)))?;
        Ok(Utc::now() + ttl)
    }

    /// Take the lease of a shard if it is free, expired or already ours.
    ///
    /// Returns `None` when another live worker holds it, the shard is
    /// finished, or a concurrent acquisition won.
    pub async fn try_acquire(&self, shard_id: &str) -> Result<Option<ShardLease>> {
        let expires_at = self.expiry()?;
        match self.store.get(shard_id).await? {
            None => {
                let lease = ShardLease {
                    shard_id: shard_id.to_string(),
                    owner: Some(self.worker_id.clone()),
                    checkpoint: None,
                    finished: false,
                    expires_at,
                    counter: 1,
                };
                if self.store.compare_and_set(None, lease.clone()).await? {
                    info!(shard = shard_id, worker = %self.worker_id, "Acquired new shard lease");
                    Ok(Some(lease))
                } else {
                    Ok(None)
                }
            }
            Some(current) if current.is_available_to(&self.worker_id, Utc::now()) => {
                let previous = current.owner.clone();
                let lease = ShardLease {
                    owner: Some(self.worker_id.clone()),
                    expires_at,
                    counter: current.counter + 1,
                    ..current.clone()
                };
                if self
                    .store
                    .compare_and_set(Some(current.counter), lease.clone())
                    .await?
                {
                    info!(
                        shard = shard_id,
                        worker = %self.worker_id,
                        previous_owner = previous.as_deref().unwrap_or("-"),
                        checkpoint = ?lease.checkpoint,
                        "Acquired shard lease"
                    );
                    Ok(Some(lease))
                } else {
                    Ok(None)
                }
            }
            Some(_) => Ok(None),
        }
    }

    async fn update(
        &self,
        held: &ShardLease,
        change: impl FnOnce(&mut ShardLease),
    ) -> Result<Option<ShardLease>> {
        let Some(current) = self.store.get(&held.shard_id).await? else {
            return Ok(None);
        };
        if current.counter != held.counter || current.owner.as_deref() != Some(&self.worker_id) {
            debug!(shard = %held.shard_id, "Shard lease was taken over");
            return Ok(None);
        }
        let mut next = current.clone();
        change(&mut next);
        next.counter = current.counter + 1;
        if self
            .store
            .compare_and_set(Some(current.counter), next.clone())
            .await?
        {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Extend a held lease; `None` means it was lost
    pub async fn renew(&self, held: &ShardLease) -> Result<Option<ShardLease>> {
        let expires_at = self.expiry()?;
        self.update(held, |lease| lease.expires_at = expires_at).await
    }

    /// Record progress and extend the lease; `None` means it was lost.
    ///
    /// A checkpoint behind the stored one leaves the stored one in place.
    pub async fn checkpoint(
        &self,
        held: &ShardLease,
        checkpoint: Checkpoint,
    ) -> Result<Option<ShardLease>> {
        let expires_at = self.expiry()?;
        let updated = self
            .update(held, |lease| {
                let merged = match lease.checkpoint.take() {
                    Some(stored) if stored > checkpoint => stored,
                    _ => checkpoint,
                };
                lease.finished = merged == Checkpoint::ShardEnd;
                lease.checkpoint = Some(merged);
                lease.expires_at = expires_at;
            })
            .await?;
        if let Some(lease) = &updated {
            debug!(shard = %lease.shard_id, checkpoint = ?lease.checkpoint, "Checkpointed shard");
        }
        Ok(updated)
    }

    /// Give up a held lease, keeping its checkpoint
    pub async fn release(&self, held: &ShardLease) -> Result<()> {
        let released = self
            .update(held, |lease| {
                lease.owner = None;
                lease.expires_at = Utc::now();
            })
            .await?;
        if released.is_some() {
            info!(shard = %held.shard_id, worker = %self.worker_id, "Released shard lease");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("worker_id", &self.worker_id)
            .field("ttl", &self.ttl)
            .finish()
    }
}
