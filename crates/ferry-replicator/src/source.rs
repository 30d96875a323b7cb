//! Source store model
//!
//! The replicator reads from a schemaless key-item store through the
//! [`SourceStore`] capability set: table listing and description, segmented
//! paginated scans, and a sharded change stream with parent/child lineage.
//! [`crate::memory::MemorySource`] and (with the `dynamodb` feature)
//! `DynamoDbSource` implement it.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use ferry_rdbc::Numeric;

use crate::error::Result;

/// A typed attribute value of a source item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    /// UTF-8 string
    String(String),
    /// Decimal number in its textual form (up to 38 significant digits)
    Number(String),
    /// Raw bytes
    Binary(Vec<u8>),
    /// Boolean
    Bool(bool),
    /// Explicit null
    Null,
    /// Ordered list of values
    List(Vec<AttrValue>),
    /// Nested map
    Map(BTreeMap<String, AttrValue>),
    /// Set of strings
    StringSet(Vec<String>),
    /// Set of numbers
    NumberSet(Vec<String>),
    /// Set of binaries
    BinarySet(Vec<Vec<u8>>),
}

impl AttrValue {
    /// Short type tag, as the source names it
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "S",
            Self::Number(_) => "N",
            Self::Binary(_) => "B",
            Self::Bool(_) => "BOOL",
            Self::Null => "NULL",
            Self::List(_) => "L",
            Self::Map(_) => "M",
            Self::StringSet(_) => "SS",
            Self::NumberSet(_) => "NS",
            Self::BinarySet(_) => "BS",
        }
    }

    /// Render as JSON; numbers stay numbers when JSON holds them exactly
    /// (otherwise they become decimal strings), binary becomes base64 and
    /// sets become arrays.
    pub fn to_json(&self) -> serde_json::Value {
        fn number(n: &str) -> serde_json::Value {
            Numeric::parse(n)
                .map(|n| n.to_json())
                .unwrap_or_else(|_| serde_json::Value::String(n.to_string()))
        }
        let b64 = |b: &[u8]| {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        };

        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => number(n),
            Self::Binary(b) => b64(b.as_slice()),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Null => serde_json::Value::Null,
            Self::List(items) => items.iter().map(AttrValue::to_json).collect(),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::StringSet(set) => set
                .iter()
                .map(|s| serde_json::Value::String(s.clone()))
                .collect(),
            Self::NumberSet(set) => set.iter().map(|n| number(n)).collect(),
            Self::BinarySet(set) => set.iter().map(|b| b64(b.as_slice())).collect(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        Self::Number(n.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// One source record: attribute name to value
pub type Item = BTreeMap<String, AttrValue>;

/// Scalar types allowed for key attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    /// `S`
    String,
    /// `N`
    Number,
    /// `B`
    Binary,
}

/// A declared attribute with its scalar type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Attribute name
    pub name: String,
    /// Declared type
    pub scalar_type: ScalarType,
}

impl AttributeDefinition {
    /// Create a definition
    pub fn new(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar_type,
        }
    }
}

/// A global or local secondary index of a source table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIndex {
    /// Index name
    pub name: String,
    /// Index partition key attribute
    pub partition_key: String,
    /// Index sort key attribute
    pub sort_key: Option<String>,
}

/// Key schema and declared attributes of a source table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTableDescription {
    /// Table name
    pub name: String,
    /// Partition (hash) key
    pub partition_key: AttributeDefinition,
    /// Sort (range) key
    pub sort_key: Option<AttributeDefinition>,
    /// Every declared attribute, keys included
    pub attributes: Vec<AttributeDefinition>,
    /// Secondary indexes
    pub secondary_indexes: Vec<SecondaryIndex>,
    /// Change stream identifier, when a stream is enabled
    pub stream_id: Option<String>,
    /// Approximate item count
    pub item_count: Option<u64>,
}

impl SourceTableDescription {
    /// A table keyed by a partition key only
    pub fn new(name: impl Into<String>, partition_key: AttributeDefinition) -> Self {
        Self {
            name: name.into(),
            attributes: vec![partition_key.clone()],
            partition_key,
            sort_key: None,
            secondary_indexes: Vec::new(),
            stream_id: None,
            item_count: None,
        }
    }

    /// Add a sort key
    pub fn with_sort_key(mut self, sort_key: AttributeDefinition) -> Self {
        self.attributes.push(sort_key.clone());
        self.sort_key = Some(sort_key);
        self
    }

    /// Declare a non-key attribute
    pub fn with_attribute(mut self, attribute: AttributeDefinition) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add a secondary index
    pub fn with_index(mut self, index: SecondaryIndex) -> Self {
        self.secondary_indexes.push(index);
        self
    }

    /// Attach a change stream
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Key attribute names, partition key first
    pub fn key_names(&self) -> Vec<&str> {
        std::iter::once(self.partition_key.name.as_str())
            .chain(self.sort_key.as_ref().map(|k| k.name.as_str()))
            .collect()
    }
}

/// Opaque position inside a segment scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub String);

/// One page request of a segmented scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    /// Table name
    pub table: String,
    /// Segment index, `0..total_segments`
    pub segment: u32,
    /// Number of segments the table is split into
    pub total_segments: u32,
    /// Resume after this token; `None` starts the segment
    pub start: Option<ContinuationToken>,
    /// Maximum items per page
    pub limit: Option<u32>,
}

/// One page of a segmented scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    /// Items in this page
    pub items: Vec<Item>,
    /// Token for the next page; `None` when the segment is exhausted
    pub next: Option<ContinuationToken>,
    /// Read capacity units consumed by this page
    pub consumed_units: f64,
}

/// Position of a record in a shard.
///
/// Sequence numbers are decimal strings of varying length; they compare
/// numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(pub String);

impl SequenceNumber {
    /// Create from any decimal string
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    fn digits(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.digits(), other.digits());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A change-stream shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Shard identifier
    pub shard_id: String,
    /// Parent shard, when this shard came from a split
    pub parent_shard_id: Option<String>,
    /// First sequence number in the shard
    pub starting_sequence: Option<SequenceNumber>,
    /// Last sequence number; present once the shard is closed
    pub ending_sequence: Option<SequenceNumber>,
}

impl ShardDescriptor {
    /// An open shard without a parent
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            starting_sequence: None,
            ending_sequence: None,
        }
    }

    /// Set the parent shard
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_shard_id = Some(parent.into());
        self
    }

    /// Mark the shard closed at `ending`
    pub fn closed_at(mut self, ending: SequenceNumber) -> Self {
        self.ending_sequence = Some(ending);
        self
    }

    /// Whether the shard no longer receives records
    pub fn is_closed(&self) -> bool {
        self.ending_sequence.is_some()
    }
}

/// Where a shard iterator starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Oldest record still retained
    TrimHorizon,
    /// At the given record
    AtSequence(SequenceNumber),
    /// Just after the given record
    AfterSequence(SequenceNumber),
}

/// Opaque shard read position handed out by the source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardIterator(pub String);

/// Mutation kind of a change record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// New item
    Insert,
    /// Item replaced
    Modify,
    /// Item deleted
    Remove,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
        })
    }
}

/// One post-commit mutation from the change stream
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Mutation kind
    pub kind: ChangeKind,
    /// Key attributes of the item
    pub keys: Item,
    /// Full item after the change (INSERT and MODIFY)
    pub new_image: Option<Item>,
    /// Position in the shard
    pub sequence: SequenceNumber,
}

/// A batch of change records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    /// Records in shard order
    pub records: Vec<ChangeRecord>,
    /// Iterator for the next poll; `None` once a closed shard is drained
    pub next_iterator: Option<ShardIterator>,
}

/// Read-side capability set of the source store
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Names of all tables
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Key schema and declared attributes; a missing table is a schema conflict
    async fn describe_table(&self, table: &str) -> Result<SourceTableDescription>;

    /// Read one page of one segment
    async fn scan(&self, request: ScanRequest) -> Result<ScanPage>;

    /// All shards of a stream, parents included while retained
    async fn list_shards(&self, stream_id: &str) -> Result<Vec<ShardDescriptor>>;

    /// Position an iterator inside a shard
    async fn shard_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<ShardIterator>;

    /// Poll one batch of records
    async fn get_records(&self, iterator: &ShardIterator, limit: u32) -> Result<RecordBatch>;
}
