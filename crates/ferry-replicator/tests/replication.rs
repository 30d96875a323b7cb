//! End-to-end replication scenarios against the in-memory source, lease
//! store and sink.

mod common;

use common::*;
use ferry_rdbc::memory::Operation;
use ferry_rdbc::{ColumnType, Numeric, TableColumn, TableRow, TableSchema, Value};
use ferry_replicator::coordinator::replicate_all_data;
use ferry_replicator::lease::{Checkpoint, LeaseStore};
use ferry_replicator::memory::SourceCall;
use ferry_replicator::source::{
    AttrValue, AttributeDefinition, ChangeKind, ScalarType, SequenceNumber, ShardDescriptor,
    SourceTableDescription,
};
use ferry_replicator::{ReplicationCoordinator, ReplicationError};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Bulk load
// ============================================================================

#[tokio::test]
async fn test_orders_load_then_modify() {
    let h = Harness::new(2);
    h.source.put_item(ORDERS, order(1, "a")).unwrap();
    h.source.put_item(ORDERS, order(2, "b")).unwrap();
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(1), Some(order(1, "a")))
        .unwrap();
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(2), Some(order(2, "b")))
        .unwrap();

    let coordinator = h.coordinator(2, "worker-a");
    assert_eq!(load(&coordinator).await, 2);
    assert_eq!(h.db.row_count(ORDERS_SINK), 2);
    assert_eq!(h.name_of(1), Some(Value::String("a".into())));

    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Modify, key(1), Some(order(1, "c")))
        .unwrap();
    let cancel = CancellationToken::new();
    let changes = coordinator.start_replicating_changes(cancel.clone()).unwrap();

    eventually("MODIFY of order 1", || {
        h.name_of(1) == Some(Value::String("c".into()))
    })
    .await;
    cancel.cancel();
    let summary = changes.await.unwrap().unwrap();

    assert_eq!(summary.records, 3);
    assert_eq!(h.db.row_count(ORDERS_SINK), 2);
    assert_eq!(h.name_of(2), Some(Value::String("b".into())));
}

#[tokio::test]
async fn test_segments_cover_every_item_once() {
    let h = Harness::new(3);
    h.source.set_page_size(3);
    for id in 0..100 {
        h.source
            .put_item(ORDERS, order(id, &format!("order-{}", id)))
            .unwrap();
    }

    let coordinator = h.coordinator(7, "worker-a");
    assert_eq!(load(&coordinator).await, 100);
    assert_eq!(h.db.row_count(ORDERS_SINK), 100);
    for id in 0..100 {
        assert!(h.has_order(id), "order {} missing", id);
    }

    // an empty table goes through COPY
    let journal = h.db.journal();
    assert_eq!(
        journal
            .iter()
            .filter(|e| e.operation == Operation::BulkLoad)
            .count(),
        100
    );
    assert!(journal.iter().all(|e| e.operation != Operation::Upsert));
}

#[tokio::test]
async fn test_reload_into_populated_table_upserts() {
    let h = Harness::new(2);
    h.source.put_item(ORDERS, order(1, "a")).unwrap();
    let coordinator = h.coordinator(2, "worker-a");
    assert_eq!(load(&coordinator).await, 1);

    h.source.put_item(ORDERS, order(1, "renamed")).unwrap();
    h.source.put_item(ORDERS, order(2, "b")).unwrap();
    let again = h.coordinator(2, "worker-a");
    assert_eq!(load(&again).await, 2);

    assert_eq!(h.db.row_count(ORDERS_SINK), 2);
    assert_eq!(h.name_of(1), Some(Value::String("renamed".into())));
}

#[tokio::test]
async fn test_wide_numbers_load_exactly() {
    let h = Harness::new(2);
    let wide = "12345678901234567890123456789012345678";
    for (id, amount) in [(1, wide), (2, "1E+30"), (3, "-1E-130")] {
        let mut item = order(id, "n");
        item.insert("amount".to_string(), AttrValue::Number(amount.into()));
        h.source.put_item(ORDERS, item).unwrap();
    }

    let coordinator = h.coordinator(2, "worker-a");
    assert_eq!(load(&coordinator).await, 3);

    let amount = |id: i64| {
        h.db.row(ORDERS_SINK, &[Value::Numeric(Numeric::from(id))])
            .and_then(|row| row.get("amount").cloned())
            .and_then(|v| v.as_numeric())
            .map(|n| n.to_string())
    };
    assert_eq!(amount(1).as_deref(), Some(wide));
    assert_eq!(
        amount(2).as_deref(),
        Some("1000000000000000000000000000000")
    );
    assert_eq!(
        amount(3),
        Some(format!("-0.{}1", "0".repeat(129)))
    );
}

fn with_customers(h: &Harness, items: i64) -> Vec<Arc<ReplicationCoordinator>> {
    h.source.add_table(SourceTableDescription::new(
        "Customers",
        AttributeDefinition::new("id", ScalarType::Number),
    ));
    for id in 0..items {
        h.source.put_item(ORDERS, order(id, "o")).unwrap();
        h.source.put_item("Customers", key(id)).unwrap();
    }
    vec![
        h.coordinator_for(ORDERS, 1, "worker-a"),
        h.coordinator_for("Customers", 1, "worker-a"),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_tables_load_concurrently() {
    let h = Harness::new(2);
    h.source.set_page_size(1);
    let coordinators = with_customers(&h, 20);
    for coordinator in &coordinators {
        coordinator.replicate_schema().await.unwrap();
    }

    let start = tokio::time::Instant::now();
    let rows = replicate_all_data(&coordinators, 1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rows, 40);
    assert_eq!(h.db.row_count("public.Customers"), 20);
    assert!(coordinators.iter().all(|c| c.is_data_loaded()));

    // each table pays about 20s of single-unit pages at 1 unit/s
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(15), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(30), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn test_first_load_failure_is_reported() {
    let h = Harness::new(2);
    let coordinators = with_customers(&h, 5);
    for coordinator in &coordinators {
        coordinator.replicate_schema().await.unwrap();
    }
    h.source
        .fail_next(SourceCall::Scan, ReplicationError::source("access denied"));

    let err = replicate_all_data(&coordinators, 0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Source { .. }), "{:?}", err);
    assert!(coordinators.iter().any(|c| !c.is_data_loaded()));
}

// ============================================================================
// Schema
// ============================================================================

#[tokio::test]
async fn test_schema_replication_is_idempotent_and_additive() {
    let h = Harness::new(1);
    h.source.put_item(ORDERS, order(1, "a")).unwrap();
    let coordinator = h.coordinator(1, "worker-a");
    load(&coordinator).await;

    let first = h.db.schema(ORDERS_SINK).unwrap();
    coordinator.replicate_schema().await.unwrap();
    assert_eq!(h.db.schema(ORDERS_SINK).unwrap(), first);

    h.source.add_table(
        orders_table().with_attribute(AttributeDefinition::new("total", ScalarType::Number)),
    );
    h.source.put_item(ORDERS, order(1, "a")).unwrap();
    coordinator.replicate_schema().await.unwrap();

    let schema = h.db.schema(ORDERS_SINK).unwrap();
    assert_eq!(schema.column_names(), vec!["id", "name", "total"]);
    assert!(schema.column("total").unwrap().nullable);
    assert_eq!(h.db.row_count(ORDERS_SINK), 1);
}

#[tokio::test]
async fn test_new_attribute_creates_column_before_row() {
    let h = Harness::new(2);
    h.source.put_item(ORDERS, order(1, "a")).unwrap();
    let coordinator = h.coordinator(2, "worker-a");
    load(&coordinator).await;

    let mut discounted = order(3, "c");
    discounted.insert("discount".to_string(), AttrValue::Number("0.5".into()));
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(3), Some(discounted))
        .unwrap();

    let cancel = CancellationToken::new();
    let changes = coordinator.start_replicating_changes(cancel.clone()).unwrap();
    eventually("order 3", || h.has_order(3)).await;
    cancel.cancel();
    changes.await.unwrap().unwrap();

    let schema = h.db.schema(ORDERS_SINK).unwrap();
    let discount = schema.column("discount").unwrap();
    assert_eq!(discount.column_type, ColumnType::Float);
    assert!(discount.nullable);

    let journal = h.db.journal();
    let created = journal
        .iter()
        .position(|e| e.operation == Operation::CreateColumn)
        .unwrap();
    let upserted = journal
        .iter()
        .position(|e| e.operation == Operation::Upsert)
        .unwrap();
    assert!(created < upserted);

    let row = h
        .db
        .row(ORDERS_SINK, &[Value::Numeric(Numeric::from(3i64))])
        .unwrap();
    assert_eq!(
        row.get("discount"),
        Some(&Value::Numeric(Numeric::parse("0.5").unwrap()))
    );
    let old = h
        .db
        .row(ORDERS_SINK, &[Value::Numeric(Numeric::from(1i64))])
        .unwrap();
    assert_eq!(old.get("discount"), Some(&Value::Null));
}

// ============================================================================
// Sink routing
// ============================================================================

#[tokio::test]
async fn test_upsert_then_lookup() {
    let h = Harness::new(4);
    let schema = Arc::new(
        TableSchema::new("public", "kv")
            .with_column(TableColumn::new("k", ColumnType::Text))
            .with_column(TableColumn::new("v", ColumnType::Integer))
            .with_primary_key(["k"]),
    );
    h.router.create_table(&schema).await.unwrap();

    let row = TableRow::new(
        schema.clone(),
        BTreeMap::from([
            ("k".to_string(), Value::String("alpha".into())),
            ("v".to_string(), Value::Int64(7)),
        ]),
    )
    .unwrap();
    h.router.upsert(&row).await.unwrap();

    let stored = h
        .db
        .row("public.kv", &[Value::String("alpha".into())])
        .unwrap();
    assert_eq!(stored.get("v"), Some(&Value::Int64(7)));

    h.router.delete(row.primary_key()).await.unwrap();
    assert_eq!(h.db.row_count("public.kv"), 0);
}

#[tokio::test]
async fn test_changes_for_one_key_apply_in_order() {
    let h = Harness::new(4);
    let coordinator = h.coordinator(4, "worker-a");
    load(&coordinator).await;

    for version in 0..50 {
        for id in [7, 8] {
            h.source
                .append_record(
                    STREAM,
                    "shard-0",
                    ChangeKind::Modify,
                    key(id),
                    Some(order(id, &format!("v{}", version))),
                )
                .unwrap();
        }
    }

    let cancel = CancellationToken::new();
    let changes = coordinator.start_replicating_changes(cancel.clone()).unwrap();
    eventually("all versions", || {
        h.name_of(7) == Some(Value::String("v49".into()))
            && h.name_of(8) == Some(Value::String("v49".into()))
    })
    .await;
    cancel.cancel();
    assert_eq!(changes.await.unwrap().unwrap().records, 100);

    // every write for one key went through the same worker
    let mut workers: BTreeMap<String, usize> = BTreeMap::new();
    for entry in h.db.journal() {
        if entry.operation != Operation::Upsert {
            continue;
        }
        let key = entry.key.unwrap();
        let worker = *workers.entry(key.clone()).or_insert(entry.worker);
        assert_eq!(worker, entry.worker, "key {} moved between workers", key);
    }
    assert_eq!(workers.len(), 2);
}

// ============================================================================
// Leases and shards
// ============================================================================

#[tokio::test]
async fn test_expired_lease_resumes_after_checkpoint() {
    let h = Harness::new(2);
    let first = h
        .source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(1), Some(order(1, "a")))
        .unwrap();
    assert_eq!(first, SequenceNumber::from(100u64));
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(2), Some(order(2, "b")))
        .unwrap();

    // worker-a checkpointed 100, then stopped renewing
    let crashed = h.lease_manager("worker-a");
    let lease = crashed.try_acquire("shard-0").await.unwrap().unwrap();
    crashed
        .checkpoint(&lease, Checkpoint::Sequence(first))
        .await
        .unwrap()
        .unwrap();
    h.leases.force_expire("shard-0");

    let coordinator = h.coordinator(2, "worker-b");
    load(&coordinator).await;
    let cancel = CancellationToken::new();
    let changes = coordinator.start_replicating_changes(cancel.clone()).unwrap();
    eventually("order 2", || h.has_order(2)).await;
    cancel.cancel();
    assert_eq!(changes.await.unwrap().unwrap().records, 1);

    // the record at 100 counts as applied by worker-a
    assert!(!h.has_order(1));
    let lease = h.leases.get("shard-0").await.unwrap().unwrap();
    assert_eq!(
        lease.checkpoint,
        Some(Checkpoint::Sequence(SequenceNumber::from(200u64)))
    );
    assert_eq!(lease.owner, None);
}

#[tokio::test]
async fn test_checkpoint_never_moves_back_across_handoff() {
    let h = Harness::new(1);
    let a = h.lease_manager("worker-a");
    let held = a.try_acquire("shard-0").await.unwrap().unwrap();
    a.checkpoint(&held, Checkpoint::Sequence(SequenceNumber::from(300u64)))
        .await
        .unwrap()
        .unwrap();
    h.leases.force_expire("shard-0");

    let b = h.lease_manager("worker-b");
    let taken = b.try_acquire("shard-0").await.unwrap().unwrap();
    assert_eq!(
        taken.resume_after(),
        Some(&SequenceNumber::from(300u64))
    );
    let after = b
        .checkpoint(&taken, Checkpoint::Sequence(SequenceNumber::from(200u64)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        after.checkpoint,
        Some(Checkpoint::Sequence(SequenceNumber::from(300u64)))
    );

    // the previous owner's lease is gone
    assert!(a
        .checkpoint(&held, Checkpoint::Sequence(SequenceNumber::from(400u64)))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_transient_lease_store_failures_are_retried() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(1, "worker-a");
    load(&coordinator).await;
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(1), Some(order(1, "a")))
        .unwrap();

    // discovery: the lease listing and the acquisition both hit errors
    for _ in 0..3 {
        h.leases
            .fail_next(ReplicationError::throttled("lease table throttled"));
    }
    let cancel = CancellationToken::new();
    let changes = coordinator.start_replicating_changes(cancel.clone()).unwrap();
    eventually("order 1", || h.has_order(1)).await;

    // checkpoints and renewals of the running shard
    for _ in 0..2 {
        h.leases
            .fail_next(ReplicationError::source_transient("lease table unavailable"));
    }
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(2), Some(order(2, "b")))
        .unwrap();
    eventually("order 2", || h.has_order(2)).await;
    eventually("injected failures consumed", || h.leases.pending_failures() == 0).await;
    cancel.cancel();

    assert_eq!(changes.await.unwrap().unwrap().records, 2);
    let lease = h.leases.get("shard-0").await.unwrap().unwrap();
    assert_eq!(
        lease.checkpoint,
        Some(Checkpoint::Sequence(SequenceNumber::from(200u64)))
    );
    assert_eq!(lease.owner, None);
}

#[tokio::test]
async fn test_child_shard_waits_for_parent() {
    let h = Harness::new(2);
    h.source
        .append_record(STREAM, "shard-0", ChangeKind::Insert, key(1), Some(order(1, "a")))
        .unwrap();
    h.source.close_shard(STREAM, "shard-0").unwrap();
    h.source
        .add_shard(STREAM, ShardDescriptor::new("shard-1").with_parent("shard-0"));
    h.source
        .append_record(STREAM, "shard-1", ChangeKind::Modify, key(1), Some(order(1, "b")))
        .unwrap();
    h.source
        .append_record(STREAM, "shard-1", ChangeKind::Remove, key(1), None)
        .unwrap();
    h.source
        .append_record(STREAM, "shard-1", ChangeKind::Insert, key(2), Some(order(2, "z")))
        .unwrap();

    let coordinator = h.coordinator(2, "worker-a");
    load(&coordinator).await;
    let cancel = CancellationToken::new();
    let changes = coordinator.start_replicating_changes(cancel.clone()).unwrap();
    eventually("child shard", || h.has_order(2)).await;
    cancel.cancel();
    let summary = changes.await.unwrap().unwrap();

    assert_eq!(summary.shards_finished, 1);
    assert!(!h.has_order(1));
    let parent = h.leases.get("shard-0").await.unwrap().unwrap();
    assert!(parent.finished);
    assert_eq!(parent.checkpoint, Some(Checkpoint::ShardEnd));
}

#[tokio::test]
async fn test_changes_require_completed_load() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(1, "worker-a");
    coordinator.replicate_schema().await.unwrap();
    assert!(coordinator
        .start_replicating_changes(CancellationToken::new())
        .is_err());
}
