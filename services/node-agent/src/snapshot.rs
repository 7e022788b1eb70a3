//! Crash-recovery snapshots of the desired-state database.
//!
//! The dumper runs in its own task so that disk I/O never holds the database
//! lock: it copies the store under the lock, releases it, and writes the copy.
//! Files are replaced atomically (write to temp, rename).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nodemgr_reconcile::{RecordStore, StoreError, StoreSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::database::Database;

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors reading or writing snapshots.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("snapshot version {found} is not supported (expected {expected})", expected = SNAPSHOT_VERSION)]
    Version { found: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("snapshot writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDatabase {
    version: u32,
    #[serde(flatten)]
    store: StoreSnapshot,
}

/// Location of the snapshot on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot. `None` if none has been written yet.
    pub fn load(&self) -> Result<Option<RecordStore>, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot, starting fresh");
                return Ok(None);
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let persisted: PersistedDatabase =
            serde_json::from_str(&content).map_err(|source| PersistenceError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if persisted.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Version {
                found: persisted.version,
            });
        }

        let store = RecordStore::from_snapshot(persisted.store)?;
        info!(
            path = %self.path.display(),
            records = store.len(),
            watermark = store.minimum_timestamp(),
            "Loaded snapshot"
        );
        Ok(Some(store))
    }

    /// Write a snapshot atomically.
    pub fn save(&self, snapshot: StoreSnapshot) -> Result<(), PersistenceError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| PersistenceError::Io { path, source }
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let records = snapshot.records.len();
        let content = serde_json::to_vec(&PersistedDatabase {
            version: SNAPSHOT_VERSION,
            store: snapshot,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &content).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &self.path).map_err(io_err(&self.path))?;

        debug!(path = %self.path.display(), records, "Saved snapshot");
        Ok(())
    }
}

/// Persist the database whenever a dump is requested, until shutdown.
///
/// Requests that arrive while a write is in progress collapse into one
/// further write. A pending dump is flushed before returning.
pub async fn run_dumper(db: Arc<Database>, file: SnapshotFile, mut shutdown: watch::Receiver<bool>) {
    info!(path = %file.path().display(), "Starting snapshot dumper");

    loop {
        tokio::select! {
            _ = db.dump_wanted() => {
                dump_once(&db, &file).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    dump_once(&db, &file).await;
                    info!("Snapshot dumper shutting down");
                    break;
                }
            }
        }
    }
}

/// Write the store if a dump is pending. Errors are logged, not returned.
pub async fn dump_once(db: &Database, file: &SnapshotFile) -> bool {
    let Some(snapshot) = db.take_dump().await else {
        return false;
    };

    let writer = file.clone();
    let result = tokio::task::spawn_blocking(move || writer.save(snapshot))
        .await
        .map_err(PersistenceError::from)
        .and_then(|saved| saved);

    match result {
        Ok(()) => true,
        Err(e) => {
            error!(
                path = %file.path().display(),
                error = %e,
                "Failed to write snapshot, will retry on next request"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodemgr_reconcile::{Loan, Record};

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested").join("db.json"));

        let mut store = RecordStore::new();
        store.deliver(Record::new("s1", "sliver.LXC", 5).with_rspec([("cpu_share", 32)]));
        store
            .set_loans("s1", vec![Loan::new("s2", "cpu_share", 2)])
            .unwrap();
        store.set_minimum_timestamp(3);

        file.save(store.snapshot()).unwrap();
        assert!(!file.path().with_extension("tmp").exists());

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.minimum_timestamp(), 3);
        assert_eq!(loaded.get("s1"), store.get("s1"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("db.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, b"{not json").unwrap();

        let err = SnapshotFile::new(&path).load().unwrap_err();
        assert!(matches!(err, PersistenceError::Parse { .. }));
    }

    #[test]
    fn test_load_wrong_version_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, br#"{"version": 99, "min_timestamp": 0, "records": {}}"#).unwrap();

        let err = SnapshotFile::new(&path).load().unwrap_err();
        assert!(matches!(err, PersistenceError::Version { found: 99 }));
    }

    #[test]
    fn test_save_into_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();

        // parent "directory" is a regular file
        let file = SnapshotFile::new(blocker.join("db.json"));
        assert!(matches!(
            file.save(StoreSnapshot::default()),
            Err(PersistenceError::Io { .. })
        ));
    }
}
