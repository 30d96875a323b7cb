//! In-memory source store for tests and dry runs
//!
//! Tables are scanned in insertion order; items are assigned to segments by
//! hashing their partition key. Streams hold shards of change records with
//! increasing sequence numbers. Failures can be injected per call kind.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{ReplicationError, Result, SchemaConflict};
use crate::hash::bucket_for;
use crate::source::{
    ChangeKind, ChangeRecord, ContinuationToken, IteratorPosition, Item, RecordBatch, ScanPage,
    ScanRequest, SequenceNumber, ShardDescriptor, ShardIterator, SourceStore,
    SourceTableDescription,
};

/// Source calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceCall {
    /// [`SourceStore::list_tables`]
    ListTables,
    /// [`SourceStore::describe_table`]
    DescribeTable,
    /// [`SourceStore::scan`]
    Scan,
    /// [`SourceStore::list_shards`]
    ListShards,
    /// [`SourceStore::shard_iterator`]
    ShardIterator,
    /// [`SourceStore::get_records`]
    GetRecords,
}

struct MemoryTable {
    description: SourceTableDescription,
    items: Vec<Item>,
}

struct MemoryShard {
    descriptor: ShardDescriptor,
    records: Vec<ChangeRecord>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, MemoryTable>,
    streams: BTreeMap<String, Vec<MemoryShard>>,
    failures: HashMap<SourceCall, VecDeque<ReplicationError>>,
    calls: HashMap<SourceCall, u64>,
    next_sequence: u64,
    page_size: Option<u32>,
}

impl State {
    fn enter(&mut self, call: SourceCall) -> Result<()> {
        *self.calls.entry(call).or_default() += 1;
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn shard_mut(&mut self, stream_id: &str, shard_id: &str) -> Result<&mut MemoryShard> {
        self.streams
            .get_mut(stream_id)
            .and_then(|shards| {
                shards
                    .iter_mut()
                    .find(|s| s.descriptor.shard_id == shard_id)
            })
            .ok_or_else(|| {
                ReplicationError::source(format!(
                    "shard {} not found in stream {}",
                    shard_id, stream_id
                ))
            })
    }
}

/// Source store held in memory
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every scan page at `size` items
    pub fn set_page_size(&self, size: u32) {
        self.state.lock().page_size = Some(size.max(1));
    }

    /// Register a table; a stream on the description is created too
    pub fn add_table(&self, description: SourceTableDescription) {
        let mut state = self.state.lock();
        if let Some(stream_id) = &description.stream_id {
            state.streams.entry(stream_id.clone()).or_default();
        }
        state.tables.insert(
            description.name.clone(),
            MemoryTable {
                description,
                items: Vec::new(),
            },
        );
    }

    /// Insert or replace an item (matched on its key attributes)
    pub fn put_item(&self, table: &str, item: Item) -> Result<()> {
        let mut state = self.state.lock();
        let table = state
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table))?;
        let keys: Vec<String> = table
            .description
            .key_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        for key in &keys {
            if !item.contains_key(key) {
                return Err(ReplicationError::source(format!(
                    "item lacks key attribute {}",
                    key
                )));
            }
        }
        match table
            .items
            .iter_mut()
            .find(|existing| keys.iter().all(|k| existing.get(k) == item.get(k)))
        {
            Some(existing) => *existing = item,
            None => table.items.push(item),
        }
        Ok(())
    }

    /// Add a shard to a stream
    pub fn add_shard(&self, stream_id: &str, shard: ShardDescriptor) {
        self.state
            .lock()
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .push(MemoryShard {
                descriptor: shard,
                records: Vec::new(),
            });
    }

    /// Append a change record to an open shard; returns its sequence number
    pub fn append_record(
        &self,
        stream_id: &str,
        shard_id: &str,
        kind: ChangeKind,
        keys: Item,
        new_image: Option<Item>,
    ) -> Result<SequenceNumber> {
        let mut state = self.state.lock();
        state.next_sequence += 100;
        let sequence = SequenceNumber::from(state.next_sequence);
        let shard = state.shard_mut(stream_id, shard_id)?;
        if shard.descriptor.is_closed() {
            return Err(ReplicationError::source(format!(
                "shard {} is closed",
                shard_id
            )));
        }
        if shard.descriptor.starting_sequence.is_none() {
            shard.descriptor.starting_sequence = Some(sequence.clone());
        }
        shard.records.push(ChangeRecord {
            kind,
            keys,
            new_image,
            sequence: sequence.clone(),
        });
        Ok(sequence)
    }

    /// Close a shard after its last record
    pub fn close_shard(&self, stream_id: &str, shard_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let fallback = SequenceNumber::from(state.next_sequence);
        let shard = state.shard_mut(stream_id, shard_id)?;
        let ending = shard
            .records
            .last()
            .map(|r| r.sequence.clone())
            .unwrap_or(fallback);
        shard.descriptor.ending_sequence = Some(ending);
        Ok(())
    }

    /// Fail the next call of the given kind with `error`
    pub fn fail_next(&self, call: SourceCall, error: ReplicationError) {
        self.state
            .lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Number of calls of the given kind made so far
    pub fn call_count(&self, call: SourceCall) -> u64 {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemorySource")
            .field("tables", &state.tables.keys().collect::<Vec<_>>())
            .field("streams", &state.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn missing_table(table: &str) -> ReplicationError {
    SchemaConflict::TableMissing {
        table: table.to_string(),
    }
    .into()
}

fn encode_iterator(stream_id: &str, shard_id: &str, offset: usize) -> ShardIterator {
    ShardIterator(format!("{}|{}|{}", offset, shard_id, stream_id))
}

fn decode_iterator(iterator: &ShardIterator) -> Result<(String, String, usize)> {
    let mut parts = iterator.0.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(offset), Some(shard), Some(stream)) => {
            let offset = offset
                .parse()
                .map_err(|_| ReplicationError::source("malformed shard iterator"))?;
            Ok((stream.to_string(), shard.to_string(), offset))
        }
        _ => Err(ReplicationError::source("malformed shard iterator")),
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.enter(SourceCall::ListTables)?;
        Ok(state.tables.keys().cloned().collect())
    }

    async fn describe_table(&self, table: &str) -> Result<SourceTableDescription> {
        let mut state = self.state.lock();
        state.enter(SourceCall::DescribeTable)?;
        let entry = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        let mut description = entry.description.clone();
        description.item_count = Some(entry.items.len() as u64);
        Ok(description)
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanPage> {
        let mut state = self.state.lock();
        state.enter(SourceCall::Scan)?;
        if request.total_segments == 0 || request.segment >= request.total_segments {
            return Err(ReplicationError::argument(format!(
                "segment {} out of range for {} segments",
                request.segment, request.total_segments
            )));
        }
        let page_size = state.page_size;
        let table = state
            .tables
            .get(&request.table)
            .ok_or_else(|| missing_table(&request.table))?;
        let partition_key = &table.description.partition_key.name;

        let segment: Vec<&Item> = table
            .items
            .iter()
            .filter(|item| {
                let key = item
                    .get(partition_key)
                    .map(|v| v.to_json().to_string())
                    .unwrap_or_default();
                bucket_for(key.as_bytes(), request.total_segments as usize)
                    == request.segment as usize
            })
            .collect();

        let offset = match &request.start {
            Some(token) => token
                .0
                .parse::<usize>()
                .map_err(|_| ReplicationError::source("malformed continuation token"))?,
            None => 0,
        };
        let limit = match (request.limit, page_size) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => u32::MAX,
        } as usize;

        let items: Vec<Item> = segment
            .iter()
            .skip(offset)
            .take(limit)
            .map(|item| (*item).clone())
            .collect();
        let end = offset + items.len();
        let next = (end < segment.len()).then(|| ContinuationToken(end.to_string()));
        // one unit per item; an empty page still costs one
        let consumed_units = items.len().max(1) as f64;

        Ok(ScanPage {
            items,
            next,
            consumed_units,
        })
    }

    async fn list_shards(&self, stream_id: &str) -> Result<Vec<ShardDescriptor>> {
        let mut state = self.state.lock();
        state.enter(SourceCall::ListShards)?;
        let shards = state.streams.get(stream_id).ok_or_else(|| {
            ReplicationError::source(format!("stream {} not found", stream_id))
        })?;
        Ok(shards.iter().map(|s| s.descriptor.clone()).collect())
    }

    async fn shard_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<ShardIterator> {
        let mut state = self.state.lock();
        state.enter(SourceCall::ShardIterator)?;
        let shard = state.shard_mut(stream_id, shard_id)?;
        let offset = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::AtSequence(seq) => shard
                .records
                .iter()
                .position(|r| r.sequence >= seq)
                .unwrap_or(shard.records.len()),
            IteratorPosition::AfterSequence(seq) => shard
                .records
                .iter()
                .position(|r| r.sequence > seq)
                .unwrap_or(shard.records.len()),
        };
        Ok(encode_iterator(stream_id, shard_id, offset))
    }

    async fn get_records(&self, iterator: &ShardIterator, limit: u32) -> Result<RecordBatch> {
        let mut state = self.state.lock();
        state.enter(SourceCall::GetRecords)?;
        let (stream_id, shard_id, offset) = decode_iterator(iterator)?;
        let shard = state.shard_mut(&stream_id, &shard_id)?;

        let end = (offset + limit.max(1) as usize).min(shard.records.len());
        let records = shard.records.get(offset..end).unwrap_or_default().to_vec();
        let drained = end >= shard.records.len();
        let next_iterator = if drained && shard.descriptor.is_closed() {
            None
        } else {
            Some(encode_iterator(&stream_id, &shard_id, end.max(offset)))
        };
        Ok(RecordBatch {
            records,
            next_iterator,
        })
    }
}
