//! Resumable scan progress
//!
//! A bulk load records, per table and segment, the continuation token of
//! the last page that reached the sink. A restarted load skips finished
//! segments and resumes the others from their token.
//!
//! [`FileProgressStore`] keeps one JSON file per table, written to a temp
//! file, synced and renamed into place. [`MemoryProgressStore`] is for tests
//! and for runs that do not need to resume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ReplicationError, Result};
use crate::source::ContinuationToken;

/// Progress of one scan segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentProgress {
    /// Token of the next page to read; `None` before the first page
    pub next: Option<ContinuationToken>,
    /// Rows written so far
    pub rows: u64,
    /// Segment fully written
    pub finished: bool,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl SegmentProgress {
    /// Progress after a page was written
    pub fn after_page(rows: u64, next: Option<ContinuationToken>) -> Self {
        Self {
            finished: next.is_none(),
            next,
            rows,
            updated_at: Utc::now(),
        }
    }
}

/// Progress of a whole table scan
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Segment count the tokens belong to
    pub total_segments: u32,
    /// Per-segment progress
    pub segments: BTreeMap<u32, SegmentProgress>,
}

impl ScanProgress {
    /// Rows written across all segments
    pub fn rows(&self) -> u64 {
        self.segments.values().map(|s| s.rows).sum()
    }

    /// Whether every segment finished
    pub fn is_complete(&self) -> bool {
        self.total_segments > 0
            && (0..self.total_segments)
                .all(|s| self.segments.get(&s).is_some_and(|p| p.finished))
    }
}

/// Persistence for [`ScanProgress`]
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Saved progress of a table
    async fn load(&self, table: &str) -> Result<Option<ScanProgress>>;

    /// Record one segment's progress
    async fn save_segment(
        &self,
        table: &str,
        total_segments: u32,
        segment: u32,
        progress: SegmentProgress,
    ) -> Result<()>;

    /// Forget a table's progress
    async fn clear(&self, table: &str) -> Result<()>;
}

fn validate_key(table: &str) -> Result<()> {
    if table.is_empty() || table.contains('/') || table.contains('\\') || table.starts_with('.') {
        return Err(ReplicationError::argument(format!(
            "table name '{}' cannot be used as a progress key",
            table
        )));
    }
    Ok(())
}

fn merge(
    current: Option<ScanProgress>,
    total_segments: u32,
    segment: u32,
    progress: SegmentProgress,
) -> ScanProgress {
    let mut scan = match current {
        Some(scan) if scan.total_segments == total_segments => scan,
        _ => ScanProgress {
            total_segments,
            segments: BTreeMap::new(),
        },
    };
    scan.segments.insert(segment, progress);
    scan
}

/// Progress kept in process memory
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    tables: RwLock<HashMap<String, ScanProgress>>,
}

impl MemoryProgressStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, table: &str) -> Result<Option<ScanProgress>> {
        Ok(self.tables.read().await.get(table).cloned())
    }

    async fn save_segment(
        &self,
        table: &str,
        total_segments: u32,
        segment: u32,
        progress: SegmentProgress,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let scan = merge(tables.remove(table), total_segments, segment, progress);
        tables.insert(table.to_string(), scan);
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.tables.write().await.remove(table);
        Ok(())
    }
}

/// Progress kept as `<dir>/<table>.scan.json`
pub struct FileProgressStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, ScanProgress>>,
    fsync: bool,
}

impl FileProgressStore {
    /// Open (creating if needed) a progress directory
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Open with explicit fsync behaviour
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        })
    }

    fn file_path(&self, table: &str) -> PathBuf {
        self.base_dir.join(format!("{}.scan.json", table))
    }

    async fn write(&self, table: &str, scan: &ScanProgress) -> Result<()> {
        let path = self.file_path(table);
        let temp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(scan)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        fs::rename(&temp, &path).await?;
        Ok(())
    }
}

impl std::fmt::Debug for FileProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileProgressStore")
            .field("base_dir", &self.base_dir)
            .field("fsync", &self.fsync)
            .finish()
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, table: &str) -> Result<Option<ScanProgress>> {
        validate_key(table)?;
        if let Some(scan) = self.cache.read().await.get(table) {
            return Ok(Some(scan.clone()));
        }

        let path = self.file_path(table);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let scan: ScanProgress = match serde_json::from_str(&contents) {
            Ok(scan) => scan,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable scan progress");
                return Ok(None);
            }
        };
        self.cache
            .write()
            .await
            .insert(table.to_string(), scan.clone());
        Ok(Some(scan))
    }

    async fn save_segment(
        &self,
        table: &str,
        total_segments: u32,
        segment: u32,
        progress: SegmentProgress,
    ) -> Result<()> {
        validate_key(table)?;
        let current = self.load(table).await?;
        // writers of one table are serialized on the cache lock
        let mut cache = self.cache.write().await;
        let current = cache.remove(table).or(current);
        let scan = merge(current, total_segments, segment, progress);
        self.write(table, &scan).await?;
        debug!(table, segment, rows = scan.rows(), "Saved scan progress");
        cache.insert(table.to_string(), scan);
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        validate_key(table)?;
        let path = self.file_path(table);
        match fs::remove_file(&path).await {
            Ok(()) => info!(table, "Cleared scan progress"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.write().await.remove(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> Option<ContinuationToken> {
        Some(ContinuationToken(s.to_string()))
    }

    #[tokio::test]
    async fn test_memory_store_merges_segments() {
        let store = MemoryProgressStore::new();
        store
            .save_segment("orders", 2, 0, SegmentProgress::after_page(10, token("a")))
            .await
            .unwrap();
        store
            .save_segment("orders", 2, 1, SegmentProgress::after_page(5, None))
            .await
            .unwrap();

        let scan = store.load("orders").await.unwrap().unwrap();
        assert_eq!(scan.rows(), 15);
        assert!(!scan.is_complete());
        assert!(scan.segments[&1].finished);

        store
            .save_segment("orders", 2, 0, SegmentProgress::after_page(12, None))
            .await
            .unwrap();
        assert!(store.load("orders").await.unwrap().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_segment_count_change_resets() {
        let store = MemoryProgressStore::new();
        store
            .save_segment("orders", 2, 0, SegmentProgress::after_page(10, token("a")))
            .await
            .unwrap();
        store
            .save_segment("orders", 4, 3, SegmentProgress::after_page(1, token("b")))
            .await
            .unwrap();
        let scan = store.load("orders").await.unwrap().unwrap();
        assert_eq!(scan.total_segments, 4);
        assert_eq!(scan.segments.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileProgressStore::with_options(dir.path(), false).await.unwrap();
            store
                .save_segment("orders", 3, 2, SegmentProgress::after_page(7, token("x")))
                .await
                .unwrap();
        }

        let store = FileProgressStore::new(dir.path()).await.unwrap();
        let scan = store.load("orders").await.unwrap().unwrap();
        assert_eq!(scan.total_segments, 3);
        assert_eq!(scan.segments[&2].next, token("x"));

        store.clear("orders").await.unwrap();
        assert!(store.load("orders").await.unwrap().is_none());
        assert!(!dir.path().join("orders.scan.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path()).await.unwrap();
        let err = store.load("../etc").await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
