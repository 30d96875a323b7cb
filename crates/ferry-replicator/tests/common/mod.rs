//! Shared fixtures for the replication scenarios

#![allow(dead_code)]

use ferry_rdbc::emitter::BoxedEmitter;
use ferry_rdbc::memory::MemoryDatabase;
use ferry_rdbc::{Numeric, Value};
use ferry_replicator::lease::{LeaseManager, MemoryLeaseStore};
use ferry_replicator::memory::MemorySource;
use ferry_replicator::rate_limiter::RateLimitConfig;
use ferry_replicator::retry::RetryConfig;
use ferry_replicator::scanner::ScanOptions;
use ferry_replicator::source::{
    AttrValue, AttributeDefinition, Item, ScalarType, ShardDescriptor, SourceTableDescription,
};
use ferry_replicator::stream::StreamOptions;
use ferry_replicator::{ConversionMode, ReplicationCoordinator, SchemaTranslator, SinkRouter};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ORDERS: &str = "Orders";
pub const ORDERS_SINK: &str = "public.Orders";
pub const STREAM: &str = "orders-stream";

/// `Orders`: numeric `id` key, string `name`, with a change stream
pub fn orders_table() -> SourceTableDescription {
    SourceTableDescription::new(ORDERS, AttributeDefinition::new("id", ScalarType::Number))
        .with_attribute(AttributeDefinition::new("name", ScalarType::String))
        .with_stream(STREAM)
}

pub fn key(id: i64) -> Item {
    Item::from([("id".to_string(), AttrValue::from(id))])
}

pub fn order(id: i64, name: &str) -> Item {
    let mut item = key(id);
    item.insert("name".to_string(), AttrValue::from(name));
    item
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig::builder()
        .max_retries(5)
        .retry_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build()
}

pub fn scan_options(segments: u32) -> ScanOptions {
    ScanOptions {
        total_segments: segments,
        max_parallel: segments as usize,
        page_limit: None,
        rate_limit: RateLimitConfig::unlimited(),
        retry: fast_retry(),
        use_upsert: false,
    }
}

/// Checkpoint after every batch, discover shards every 20ms
pub fn stream_options() -> StreamOptions {
    StreamOptions {
        poll_limit: 100,
        idle_poll: Duration::from_millis(10),
        checkpoint_interval: Duration::ZERO,
        heartbeat_interval: Duration::from_millis(50),
        discovery_interval: Duration::from_millis(20),
        retry: fast_retry(),
    }
}

/// In-memory source, sink and lease table
pub struct Harness {
    pub source: MemorySource,
    pub db: MemoryDatabase,
    pub router: Arc<SinkRouter>,
    pub leases: MemoryLeaseStore,
}

impl Harness {
    /// `workers` sink workers, `Orders` registered with one open shard
    pub fn new(workers: usize) -> Self {
        let source = MemorySource::new();
        source.add_table(orders_table());
        source.add_shard(STREAM, ShardDescriptor::new("shard-0"));

        let db = MemoryDatabase::new();
        let emitters: Vec<BoxedEmitter> = (0..workers)
            .map(|i| Box::new(db.emitter(i)) as BoxedEmitter)
            .collect();
        Self {
            source,
            db,
            router: Arc::new(SinkRouter::new(emitters).unwrap()),
            leases: MemoryLeaseStore::new(),
        }
    }

    pub fn lease_manager(&self, worker: &str) -> LeaseManager {
        LeaseManager::new(
            Arc::new(self.leases.clone()),
            worker,
            Duration::from_secs(30),
        )
    }

    pub fn coordinator(&self, segments: u32, worker: &str) -> Arc<ReplicationCoordinator> {
        self.coordinator_for(ORDERS, segments, worker)
    }

    pub fn coordinator_for(
        &self,
        table: &str,
        segments: u32,
        worker: &str,
    ) -> Arc<ReplicationCoordinator> {
        Arc::new(
            ReplicationCoordinator::new(
                table,
                Arc::new(self.source.clone()),
                self.router.clone(),
                Arc::new(SchemaTranslator::new("public", ConversionMode::Columns)),
            )
            .with_scan_options(scan_options(segments))
            .with_stream_options(stream_options())
            .with_leases(self.lease_manager(worker)),
        )
    }

    /// `name` of order `id` in the sink
    pub fn name_of(&self, id: i64) -> Option<Value> {
        self.db
            .row(ORDERS_SINK, &[Value::Numeric(Numeric::from(id))])
            .and_then(|row| row.get("name").cloned())
    }

    pub fn has_order(&self, id: i64) -> bool {
        self.db
            .row(ORDERS_SINK, &[Value::Numeric(Numeric::from(id))])
            .is_some()
    }
}

/// Run the schema and data phases; returns the loaded row count
pub async fn load(coordinator: &ReplicationCoordinator) -> u64 {
    coordinator.replicate_schema().await.unwrap();
    coordinator
        .start_replicating_data(0, tokio_util::sync::CancellationToken::new())
        .unwrap()
        .await
        .unwrap()
        .unwrap()
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
