//! Integration tests for database persistence across restarts.

use std::sync::Arc;
use std::time::Duration;

use nodemgr_node_agent::accounts::{Accounts, BackendRegistry, InMemoryDirectory};
use nodemgr_node_agent::database::{Database, ReconcileConfig};
use nodemgr_node_agent::mock::{CallLog, MockBackend};
use nodemgr_node_agent::snapshot::{dump_once, run_dumper, SnapshotFile};
use nodemgr_reconcile::{Loan, Record, RecordStore};
use tokio::sync::watch;

fn accounts() -> Arc<Accounts> {
    let directory = Arc::new(InMemoryDirectory::new());
    let mut backends = BackendRegistry::new(directory.clone());
    backends
        .register(Arc::new(MockBackend::new(
            "sliver.LXC",
            "/bin/vsh",
            directory,
            CallLog::default(),
        )))
        .unwrap();
    Arc::new(Accounts::new(backends))
}

#[tokio::test]
async fn test_dumper_persists_after_sync_and_restores() {
    let dir = tempfile::tempdir().unwrap();
    let file = SnapshotFile::new(dir.path().join("database.json"));

    let db = Arc::new(Database::new(
        RecordStore::new(),
        accounts(),
        ReconcileConfig::default(),
    ));
    db.deliver(Record::new("s1", "sliver.LXC", 5).with_rspec([("cpu_share", 32)]))
        .await;
    db.deliver(Record::new("s2", "sliver.LXC", 5)).await;
    db.set_loans("s1", vec![Loan::new("s2", "cpu_share", 8)])
        .await
        .unwrap();
    db.set_minimum_timestamp(4).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dumper = tokio::spawn(run_dumper(Arc::clone(&db), file.clone(), shutdown_rx));

    db.sync().await;

    // wait for the dumper to pick up the request
    tokio::time::timeout(Duration::from_secs(5), async {
        while !file.path().exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot was never written");

    shutdown_tx.send(true).unwrap();
    dumper.await.unwrap();

    let restored = Database::open(&file, accounts(), ReconcileConfig::default());
    assert_eq!(restored.len().await, 2);
    let s1 = restored.get("s1").await.unwrap();
    assert_eq!(s1.private.loans, vec![Loan::new("s2", "cpu_share", 8)]);
    assert_eq!(s1.private.effective_rspec["cpu_share"], 24);

    // the watermark survives: older deliveries are still rejected
    restored.deliver(Record::new("s3", "sliver.LXC", 3)).await;
    assert!(restored.get("s3").await.is_none());
}

#[tokio::test]
async fn test_dumper_flushes_pending_dump_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let file = SnapshotFile::new(dir.path().join("database.json"));
    let db = Arc::new(Database::new(
        RecordStore::new(),
        accounts(),
        ReconcileConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    db.deliver(Record::new("s1", "sliver.LXC", 1)).await;
    db.request_dump().await;
    shutdown_tx.send(true).unwrap();

    run_dumper(Arc::clone(&db), file.clone(), shutdown_rx).await;

    assert!(file.path().exists());
    let restored = Database::open(&file, accounts(), ReconcileConfig::default());
    assert!(restored.get("s1").await.is_some());
}

#[tokio::test]
async fn test_repeated_requests_collapse_into_one_write() {
    let dir = tempfile::tempdir().unwrap();
    let file = SnapshotFile::new(dir.path().join("database.json"));
    let db = Database::new(RecordStore::new(), accounts(), ReconcileConfig::default());

    for _ in 0..5 {
        db.request_dump().await;
    }

    assert!(dump_once(&db, &file).await);
    assert!(!dump_once(&db, &file).await);
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("database.json");
    std::fs::write(&path, b"{\"version\": 1, \"records\": [").unwrap();

    let db = Database::open(&SnapshotFile::new(&path), accounts(), ReconcileConfig::default());
    assert!(db.is_empty().await);
}

#[tokio::test]
async fn test_failed_write_is_retried_on_next_request() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let file = SnapshotFile::new(blocker.join("database.json"));
    let db = Database::new(RecordStore::new(), accounts(), ReconcileConfig::default());

    db.request_dump().await;
    assert!(!dump_once(&db, &file).await);

    std::fs::remove_file(&blocker).unwrap();
    db.request_dump().await;
    assert!(dump_once(&db, &file).await);
    assert!(file.path().exists());
}
