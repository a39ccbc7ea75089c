//! Randomized concurrency tests for the transaction helper on the embedded engine.
//!
//! Many tasks race for the single write connection; each one commits, fails or
//! panics at random. Whatever the interleaving, exactly the committed units of
//! work must be visible afterwards.

use pos_storage::config::DatabaseConfig;
use pos_storage::db::{ConnectionSet, ShutdownHook, TransactionAbility};
use pos_storage::error::DbError;
use rand::Rng;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Fail,
    Panic,
}

fn random_plan(len: usize) -> Vec<(Outcome, u64)> {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let outcome = match rng.gen_range(0..10) {
                0..=5 => Outcome::Commit,
                6..=8 => Outcome::Fail,
                _ => Outcome::Panic,
            };
            (outcome, rng.gen_range(0..5))
        })
        .collect()
}

async fn setup() -> (TempDir, ConnectionSet, ShutdownHook) {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::sqlite(dir.path().join("fuzz.db"));
    let (set, hook) = ConnectionSet::open(&config).await.unwrap();
    set.writer()
        .execute_script(
            "CREATE TABLE ledger (id INTEGER PRIMARY KEY AUTOINCREMENT, task INTEGER NOT NULL, line INTEGER NOT NULL);",
        )
        .await
        .unwrap();
    (dir, set, hook)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fuzz_mixed_outcomes_keep_only_commits() {
    let (_dir, set, hook) = setup().await;
    let plan = random_plan(60);
    let commits = plan.iter().filter(|(o, _)| *o == Outcome::Commit).count() as i64;

    let mut handles = Vec::new();
    for (task, (outcome, pause_ms)) in plan.iter().copied().enumerate() {
        let writer = set.writer();
        let task = task as i64;
        handles.push(tokio::spawn(async move {
            writer
                .transaction(move |tx| async move {
                    tx.execute(
                        "INSERT INTO ledger (task, line) VALUES ($1, $2)",
                        &[task.into(), 1i64.into()],
                    )
                    .await?;
                    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                    match outcome {
                        Outcome::Commit => {}
                        Outcome::Fail => return Err(DbError::internal("voided sale")),
                        Outcome::Panic => panic!("scanner crashed"),
                    }
                    tx.execute(
                        "INSERT INTO ledger (task, line) VALUES ($1, $2)",
                        &[task.into(), 2i64.into()],
                    )
                    .await?;
                    Ok::<_, DbError>(())
                })
                .await
        }));
    }

    for (handle, (outcome, _)) in handles.into_iter().zip(plan.iter()) {
        let joined = handle.await;
        match outcome {
            Outcome::Commit => joined.unwrap().unwrap(),
            Outcome::Fail => assert!(matches!(
                joined.unwrap(),
                Err(DbError::Internal { .. })
            )),
            Outcome::Panic => assert!(joined.unwrap_err().is_panic()),
        }
    }

    let tasks: Option<i64> = set
        .reader()
        .fetch_scalar("SELECT COUNT(DISTINCT task) FROM ledger", &[])
        .await
        .unwrap();
    assert_eq!(tasks, Some(commits));

    // Every committed task wrote both of its lines
    let lines: Option<i64> = set
        .reader()
        .fetch_scalar("SELECT COUNT(*) FROM ledger", &[])
        .await
        .unwrap();
    assert_eq!(lines, Some(commits * 2));

    hook.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fuzz_readers_never_see_partial_units() {
    let (_dir, set, hook) = setup().await;
    let plan = random_plan(30);

    let writers: Vec<_> = plan
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, (outcome, _))| *outcome != Outcome::Panic)
        .map(|(task, (outcome, pause_ms))| {
            let writer = set.writer();
            let task = task as i64;
            tokio::spawn(async move {
                let _ = writer
                    .transaction(move |tx| async move {
                        tx.execute(
                            "INSERT INTO ledger (task, line) VALUES ($1, 1)",
                            &[task.into()],
                        )
                        .await?;
                        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                        if outcome == Outcome::Fail {
                            return Err(DbError::internal("voided sale"));
                        }
                        tx.execute(
                            "INSERT INTO ledger (task, line) VALUES ($1, 2)",
                            &[task.into()],
                        )
                        .await?;
                        Ok::<_, DbError>(())
                    })
                    .await;
            })
        })
        .collect();

    // Readers poll while writers run; lines always come in complete pairs
    let reader = set.reader();
    let poller = tokio::spawn(async move {
        for _ in 0..50 {
            let odd: Option<i64> = reader
                .fetch_scalar(
                    "SELECT COUNT(*) FROM (SELECT task FROM ledger GROUP BY task HAVING COUNT(*) <> 2)",
                    &[],
                )
                .await
                .unwrap();
            assert_eq!(odd, Some(0));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    for handle in writers {
        handle.await.unwrap();
    }
    poller.await.unwrap();

    hook.stop().await.unwrap();
}
