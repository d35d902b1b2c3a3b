//! Checkpoint management.
//!
//! The checkpoint is the low-water-mark transaction id per
//! `(database, index)` pair: the highest txid whose changes are durably
//! indexed. It only ever moves forward. Storage is either a dotfile named
//! after the sanitized sync name or a key in the broker, selected by
//! `REDIS_CHECKPOINT`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Sanitized `database_index` key naming the checkpoint, the queue and the
/// replication slot.
pub fn sync_name(database: &str, index: &str) -> String {
    format!("{}_{}", database.to_lowercase(), index)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub txmin_committed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(txmin_committed: u64) -> Self {
        Checkpoint {
            txmin_committed,
            updated_at: Utc::now(),
        }
    }

    /// Move the checkpoint forward; never backwards.
    pub fn advance_to(&mut self, txid: u64) -> bool {
        if txid > self.txmin_committed {
            self.txmin_committed = txid;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError>;
    async fn delete(&self) -> Result<(), SyncError>;
}

/// Filesystem store: a dotfile under the checkpoint directory.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        FileStore {
            path: dir.as_ref().join(format!(".{name}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let content = serde_json::to_string(checkpoint)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<(), SyncError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Broker store: the checkpoint lives under the queue's meta key.
pub struct BrokerStore {
    conn: redis::aio::MultiplexedConnection,
    key: String,
}

impl BrokerStore {
    pub fn new(conn: redis::aio::MultiplexedConnection, name: &str) -> Self {
        BrokerStore {
            conn,
            key: format!("queue:{name}:meta"),
        }
    }

    pub async fn connect(url: &str, name: &str) -> Result<Self, SyncError> {
        let client =
            redis::Client::open(url).map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        Ok(BrokerStore::new(conn, name))
    }
}

#[async_trait]
impl CheckpointStore for BrokerStore {
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(&self.key)
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        match raw {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        let content = serde_json::to_string(checkpoint)?;
        conn.set::<_, _, ()>(&self.key, content)
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&self.key)
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// Position of one parallel-backfill worker over the pivot's physical pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtidCheckpoint {
    /// Pages below this bound are durably indexed.
    pub page: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-worker ctid checkpoint file, `<database>_<index>.ctid` with the
/// worker ordinal inserted when more than one worker runs.
pub struct CtidCheckpointFile {
    path: PathBuf,
}

impl CtidCheckpointFile {
    pub fn new(dir: impl AsRef<Path>, name: &str, worker: usize) -> Self {
        let filename = if worker == 0 {
            format!("{name}.ctid")
        } else {
            format!("{name}.{worker}.ctid")
        };
        CtidCheckpointFile {
            path: dir.as_ref().join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<CtidCheckpoint>, SyncError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, page: u64) -> Result<(), SyncError> {
        let checkpoint = CtidCheckpoint {
            page,
            updated_at: Utc::now(),
        };
        std::fs::write(&self.path, serde_json::to_string(&checkpoint)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_name_sanitized() {
        assert_eq!(sync_name("Bookstore", "book-index"), "bookstore_bookindex");
        assert_eq!(sync_name("db", "db"), "db_db");
        assert_eq!(sync_name("my.db", "idx 1"), "mydb_idx1");
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let mut checkpoint = Checkpoint::new(100);
        assert!(checkpoint.advance_to(150));
        assert_eq!(checkpoint.txmin_committed, 150);
        assert!(!checkpoint.advance_to(120));
        assert_eq!(checkpoint.txmin_committed, 150);
        assert!(!checkpoint.advance_to(150));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), "bookstore_bookstore");

        assert!(store.load().await.unwrap().is_none());

        let checkpoint = Checkpoint::new(42);
        store.save(&checkpoint).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.txmin_committed, 42);

        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        // deleting a missing checkpoint is not an error
        store.delete().await.unwrap();
    }

    #[test]
    fn test_ctid_checkpoint_file_naming() {
        let dir = tempfile::tempdir().unwrap();
        let first = CtidCheckpointFile::new(dir.path(), "db_idx", 0);
        assert!(first.path().ends_with("db_idx.ctid"));
        let third = CtidCheckpointFile::new(dir.path(), "db_idx", 2);
        assert!(third.path().ends_with("db_idx.2.ctid"));

        first.save(17).unwrap();
        assert_eq!(first.load().unwrap().unwrap().page, 17);
        assert!(third.load().unwrap().is_none());
    }
}
