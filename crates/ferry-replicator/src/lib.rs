//! # ferry-replicator
//!
//! Replicates key-item tables (DynamoDB) into PostgreSQL or Citus.
//!
//! Each table goes through three phases, driven by a
//! [`ReplicationCoordinator`]:
//!
//! 1. **Schema**: derive columns from the key schema and declared attributes,
//!    create the sink table or add the columns it lacks
//! 2. **Data**: parallel segmented scan under a read-capacity ceiling, bulk
//!    `COPY` into empty tables, resumable from saved progress
//! 3. **Changes**: consume the table's change stream shard by shard, with
//!    leases so several processes can share the work
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   scan    ┌──────────────────┐
//! │ SourceStore │──────────▶│ SegmentedScanner │──┐
//! │  (DynamoDB) │  records  ├──────────────────┤  │  TableRow  ┌────────────┐     ┌──────────────┐
//! │             │──────────▶│  StreamConsumer  │──┼───────────▶│ SinkRouter │────▶│ TableEmitter │ x K
//! └─────────────┘           └────────┬─────────┘  │            └────────────┘     └──────────────┘
//!                                    │            │          hash(pk) mod K
//!                              ┌─────▼──────┐     │
//!                              │ LeaseStore │     │ SchemaTranslator + LiveSchema
//!                              └────────────┘     └ (new attributes become columns)
//! ```
//!
//! Writes for one primary key always go through the same sink worker, so
//! they are applied in the order they were routed.
//!
//! ## Feature Flags
//!
//! - `dynamodb` - DynamoDB source and lease store via the AWS SDK (default)
//! - `postgres` - PostgreSQL/Citus sink via tokio-postgres (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod lease;
pub mod live_schema;
pub mod memory;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
pub mod router;
pub mod scanner;
pub mod source;
pub mod stream;
pub mod translator;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ReplicatorConfig;
    pub use crate::coordinator::{replicable_tables, ReplicationCoordinator};
    pub use crate::error::{ReplicationError, Result, SchemaConflict};
    pub use crate::lease::{Checkpoint, LeaseManager, LeaseStore, MemoryLeaseStore, ShardLease};
    pub use crate::live_schema::LiveSchema;
    pub use crate::memory::MemorySource;
    pub use crate::progress::{FileProgressStore, MemoryProgressStore, ProgressStore};
    pub use crate::rate_limiter::{RateLimitConfig, ReadCapacityLimiter};
    pub use crate::retry::RetryConfig;
    pub use crate::router::{RouterStats, SinkRouter};
    pub use crate::scanner::{ScanOptions, ScanSummary, SegmentedScanner};
    pub use crate::source::{
        AttrValue, AttributeDefinition, ChangeKind, ChangeRecord, Item, ScalarType,
        SequenceNumber, ShardDescriptor, SourceStore, SourceTableDescription,
    };
    pub use crate::stream::{StreamConsumer, StreamOptions, StreamSummary};
    pub use crate::translator::{ConversionMode, SchemaTranslator};

    #[cfg(feature = "dynamodb")]
    pub use crate::dynamodb::{DynamoDbLeaseStore, DynamoDbSource};
}

pub use config::ReplicatorConfig;
pub use coordinator::ReplicationCoordinator;
pub use error::{ReplicationError, Result};
pub use router::SinkRouter;
pub use source::SourceStore;
pub use translator::{ConversionMode, SchemaTranslator};
