//! Integration tests for the ferry-rdbc emitters

use ferry_rdbc::memory::Operation;
use ferry_rdbc::prelude::*;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

fn orders() -> Arc<TableSchema> {
    Arc::new(
        TableSchema::new("public", "orders")
            .with_column(TableColumn::new("customer", ColumnType::Text))
            .with_column(TableColumn::new("order_id", ColumnType::Float))
            .with_column(TableColumn::new("total", ColumnType::Float))
            .with_column(TableColumn::new("paid", ColumnType::Boolean))
            .with_primary_key(["customer", "order_id"])
            .with_distribution_column("customer"),
    )
}

fn order(schema: &Arc<TableSchema>, customer: &str, id: i64, total: Option<&str>) -> TableRow {
    let mut values = BTreeMap::new();
    values.insert("customer".to_string(), Value::from(customer));
    values.insert("order_id".to_string(), Value::Int64(id));
    if let Some(total) = total {
        values.insert("total".to_string(), Value::from(total));
    }
    TableRow::new(schema.clone(), values).unwrap()
}

// ============================================================================
// Memory Emitter Tests
// ============================================================================

#[tokio::test]
async fn test_memory_round_trip_through_schema() {
    let db = MemoryDatabase::new();
    let emitter = db.emitter(0);
    let schema = orders();

    assert!(emitter.fetch_schema("orders", "public").await.unwrap().is_none());
    emitter.create_table(&schema).await.unwrap();

    let fetched = emitter.fetch_schema("orders", "public").await.unwrap().unwrap();
    assert_eq!(fetched.primary_key(), schema.primary_key());
    assert_eq!(fetched.distribution_column.as_deref(), Some("customer"));

    let loaded = emitter
        .bulk_load(
            &schema,
            &[
                order(&schema, "alice", 1, Some("10.50")),
                order(&schema, "bob", 2, None),
            ],
        )
        .await
        .unwrap();
    assert_eq!(loaded, 2);

    let row = db
        .row(
            "public.orders",
            &[Value::from("alice"), Value::Numeric(Numeric::from(1i64))],
        )
        .unwrap();
    assert_eq!(
        row.get("total"),
        Some(&Value::Numeric(Numeric::parse("10.5").unwrap()))
    );
    assert_eq!(row.get("paid"), Some(&Value::Null));
}

#[tokio::test]
async fn test_memory_schema_evolution_between_writes() {
    let db = MemoryDatabase::new();
    let emitter = db.emitter(0);
    let schema = orders();
    emitter.create_table(&schema).await.unwrap();

    let mut evolved = (*schema).clone();
    let discount = TableColumn::new("discount", ColumnType::Float);
    evolved.add_column(discount.clone()).unwrap();
    emitter.create_column(&schema, &discount).await.unwrap();

    let evolved = Arc::new(evolved);
    let mut values = BTreeMap::new();
    values.insert("customer".to_string(), Value::from("carol"));
    values.insert("order_id".to_string(), Value::Int64(9));
    values.insert("discount".to_string(), Value::Int64(5));
    emitter
        .upsert(&TableRow::new(evolved, values).unwrap())
        .await
        .unwrap();

    let stored = db.schema("public.orders").unwrap();
    assert_eq!(
        stored.column_names(),
        vec!["customer", "order_id", "total", "paid", "discount"]
    );
    assert_eq!(db.rows("public.orders")[0].get("discount"), Some(&Value::Numeric(Numeric::from(5i64))));
}

#[tokio::test]
async fn test_memory_journal_tracks_workers() {
    let db = MemoryDatabase::new();
    let schema = orders();
    db.emitter(0).create_table(&schema).await.unwrap();

    let a = db.emitter(1);
    let b = db.emitter(2);
    a.upsert(&order(&schema, "alice", 1, None)).await.unwrap();
    b.upsert(&order(&schema, "bob", 1, None)).await.unwrap();
    a.delete(order(&schema, "alice", 1, None).primary_key())
        .await
        .unwrap();

    let journal: Vec<_> = db
        .journal()
        .into_iter()
        .filter(|e| e.operation != Operation::CreateTable)
        .map(|e| (e.worker, e.operation))
        .collect();
    assert_eq!(
        journal,
        vec![
            (1, Operation::Upsert),
            (2, Operation::Upsert),
            (1, Operation::Delete)
        ]
    );
}

// ============================================================================
// Stdout Emitter Tests
// ============================================================================

#[tokio::test]
async fn test_stdout_script_for_distributed_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.sql");
    let file = std::fs::File::create(&path).unwrap();

    let emitter = StdoutEmitter::with_writer(Box::new(file)).with_distribution(true);
    let schema = orders();
    assert!(emitter.supports_distribution().await.unwrap());
    emitter.create_table(&schema).await.unwrap();
    emitter
        .bulk_load(&schema, &[order(&schema, "a\tb", 1, Some("1"))])
        .await
        .unwrap();
    emitter.close().await.unwrap();

    let script = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = script.lines().collect();
    assert!(lines[0].starts_with("CREATE TABLE \"public\".\"orders\""));
    assert_eq!(
        lines[1],
        "SELECT create_distributed_table('\"public\".\"orders\"', 'customer');"
    );
    assert_eq!(
        lines[2],
        "COPY \"public\".\"orders\" (\"customer\", \"order_id\", \"total\", \"paid\") FROM STDIN;"
    );
    assert_eq!(lines[3], "a\\tb\t1\t1\t\\N");
    assert_eq!(lines[4], "\\.");
}
