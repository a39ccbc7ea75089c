//! Integration tests for the embedded engine connection set.

use pos_storage::config::{DatabaseConfig, PoolSize};
use pos_storage::db::{ConnectionSet, ShutdownHook, TransactionAbility};
use pos_storage::error::DbError;
use pos_storage::models::{Engine, QueryParam};
use serde_json::{Value as JsonValue, json};
use tempfile::TempDir;

async fn setup() -> (TempDir, ConnectionSet, ShutdownHook) {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::sqlite(dir.path().join("pos.db"));
    let (set, hook) = ConnectionSet::open(&config).await.unwrap();
    set.writer()
        .execute(
            "CREATE TABLE sales (id INTEGER PRIMARY KEY AUTOINCREMENT, amount INTEGER NOT NULL)",
            &[],
        )
        .await
        .unwrap();
    (dir, set, hook)
}

#[tokio::test]
async fn test_write_pool_is_single_connection() {
    let (_dir, set, hook) = setup().await;

    assert_eq!(set.engine(), Engine::SQLite);
    assert!(!set.is_shared());
    assert_eq!(set.write_pool().max_connections(), 1);
    assert!(set.write_pool().size() <= 1);
    assert_eq!(set.read_pool().max_connections(), 10);

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_handle_refuses_writes() {
    let (_dir, set, hook) = setup().await;

    let err = set
        .reader()
        .execute("INSERT INTO sales (amount) VALUES ($1)", &[100i64.into()])
        .await
        .unwrap_err();
    assert!(
        matches!(err, DbError::Database { engine: Engine::SQLite, .. }),
        "unexpected error: {err}"
    );
    assert!(err.to_string().to_lowercase().contains("readonly"));

    // Reads through the same handle still work
    let count: Option<i64> = set
        .reader()
        .fetch_scalar("SELECT COUNT(*) FROM sales", &[])
        .await
        .unwrap();
    assert_eq!(count, Some(0));

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_writers_all_land() {
    let (_dir, set, hook) = setup().await;
    const WRITERS: i64 = 25;

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let writer = set.writer();
        handles.push(tokio::spawn(async move {
            writer
                .transaction(move |tx| async move {
                    tx.execute("INSERT INTO sales (amount) VALUES ($1)", &[i.into()])
                        .await
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    let rows = set
        .reader()
        .fetch_all("SELECT amount FROM sales ORDER BY amount", &[])
        .await
        .unwrap();
    let amounts: Vec<i64> = rows
        .iter()
        .map(|r| r["amount"].as_i64().unwrap())
        .collect();
    assert_eq!(amounts, (0..WRITERS).collect::<Vec<_>>());

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_dirty_reads_between_handles() {
    let (_dir, set, hook) = setup().await;
    let reader = set.reader();

    set.writer()
        .transaction(move |tx| async move {
            tx.execute("INSERT INTO sales (amount) VALUES ($1)", &[42i64.into()])
                .await?;

            let inside: Option<i64> = tx.fetch_scalar("SELECT COUNT(*) FROM sales", &[]).await?;
            assert_eq!(inside, Some(1));

            let outside: Option<i64> = reader.fetch_scalar("SELECT COUNT(*) FROM sales", &[]).await?;
            assert_eq!(outside, Some(0));
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    let after: Option<i64> = set
        .reader()
        .fetch_scalar("SELECT COUNT(*) FROM sales", &[])
        .await
        .unwrap();
    assert_eq!(after, Some(1));

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_foreign_keys_enforced() {
    let (_dir, set, hook) = setup().await;
    let writer = set.writer();

    writer
        .execute_script(
            "CREATE TABLE tills (id INTEGER PRIMARY KEY);
             CREATE TABLE receipts (id INTEGER PRIMARY KEY, till_id INTEGER NOT NULL REFERENCES tills (id));",
        )
        .await
        .unwrap();

    let err = writer
        .execute("INSERT INTO receipts (till_id) VALUES ($1)", &[7i64.into()])
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("foreign key"));

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_unusable_path_is_connection_error() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"plain file").unwrap();

    let config = DatabaseConfig::sqlite(blocker.join("pos.db"));
    let err = ConnectionSet::open(&config).await.unwrap_err();
    assert!(
        matches!(err, DbError::Connection { engine: Engine::SQLite, .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_invalid_pool_size_rejected_before_connecting() {
    let dir = TempDir::new().unwrap();
    let mut config = DatabaseConfig::sqlite(dir.path().join("pos.db"));
    config.read_pool = PoolSize::new(2, 5);

    let err = ConnectionSet::open(&config).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidConfig { .. }));
    assert!(!dir.path().join("pos.db").exists());
}

#[tokio::test]
async fn test_shutdown_closes_every_pool_once() {
    let (_dir, set, hook) = setup().await;
    assert_eq!(hook.pool_count(), 2);

    hook.stop().await.unwrap();

    assert!(set.write_pool().is_closed());
    assert!(set.read_pool().is_closed());
    let err = set.ping().await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_reopen_existing_file() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::sqlite(dir.path().join("pos.db"));

    let (set, hook) = ConnectionSet::open(&config).await.unwrap();
    set.writer()
        .execute_script("CREATE TABLE kept (v TEXT); INSERT INTO kept VALUES ('x');")
        .await
        .unwrap();
    hook.stop().await.unwrap();

    let (set, hook) = ConnectionSet::open(&config).await.unwrap();
    let v: Option<String> = set
        .reader()
        .fetch_scalar("SELECT v FROM kept", &[])
        .await
        .unwrap();
    assert_eq!(v.as_deref(), Some("x"));
    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_every_param_and_storage_class_round_trips() {
    let (_dir, set, hook) = setup().await;
    let writer = set.writer();
    writer
        .execute(
            "CREATE TABLE till_audit (
                i INTEGER, r REAL, price NUMERIC, d DECIMAL(10,2), flag BOOLEAN,
                note TEXT, raw BLOB, at DATETIME, doc JSON, missing INTEGER
            )",
            &[],
        )
        .await
        .unwrap();

    let params = [
        QueryParam::Int(42),
        QueryParam::Float(1.5),
        QueryParam::Int(3),
        QueryParam::Float(2.25),
        QueryParam::Bool(true),
        QueryParam::String("drawer open".to_string()),
        QueryParam::Bytes(b"hi".to_vec()),
        QueryParam::String("2024-12-09 10:00:00".to_string()),
        QueryParam::Json(json!({"a": 1})),
        QueryParam::Null,
    ];
    writer
        .execute(
            "INSERT INTO till_audit VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &params,
        )
        .await
        .unwrap();

    let row = set
        .reader()
        .fetch_optional("SELECT * FROM till_audit", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["i"], json!(42));
    assert_eq!(row["r"], json!(1.5));
    // NUMERIC affinity keeps integers as integers
    assert_eq!(row["price"], json!(3));
    assert_eq!(row["d"], json!(2.25));
    assert_eq!(row["flag"], json!(true));
    assert_eq!(row["note"], json!("drawer open"));
    assert_eq!(row["raw"], json!("aGk="));
    assert_eq!(row["at"], json!("2024-12-09 10:00:00"));
    // JSON is stored as its text on this engine
    assert_eq!(row["doc"], json!("{\"a\":1}"));
    assert_eq!(row["missing"], JsonValue::Null);

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_decimal_column_holding_integer_reads_back() {
    let (_dir, set, hook) = setup().await;
    let writer = set.writer();
    writer
        .execute_script(
            "CREATE TABLE prices (price NUMERIC, at DATETIME, d DECIMAL(10,2));
             INSERT INTO prices VALUES (3, '2024-12-09 10:00:00', 2);",
        )
        .await
        .unwrap();

    let rows = set
        .reader()
        .fetch_all("SELECT price, at, d FROM prices", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["price"], json!(3));
    assert_eq!(rows[0]["at"], json!("2024-12-09 10:00:00"));
    assert_eq!(rows[0]["d"], json!(2));

    hook.stop().await.unwrap();
}

#[tokio::test]
async fn test_null_param_into_integer_column() {
    let (_dir, set, hook) = setup().await;
    let writer = set.writer();
    writer
        .execute("CREATE TABLE refunds (sale_id INTEGER, amount INTEGER NOT NULL)", &[])
        .await
        .unwrap();
    writer
        .execute(
            "INSERT INTO refunds (sale_id, amount) VALUES ($1, $2)",
            &[None::<i64>.into(), 250i64.into()],
        )
        .await
        .unwrap();

    let missing: Option<i64> = set
        .reader()
        .fetch_scalar("SELECT COUNT(*) FROM refunds WHERE sale_id IS NULL", &[])
        .await
        .unwrap();
    assert_eq!(missing, Some(1));

    hook.stop().await.unwrap();
}
