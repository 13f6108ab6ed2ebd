use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PlaneError, Result};

/// Where in a transition a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Before side effects; `list` is the source list.
    Pre,
    /// After side effects; `list` is the target list.
    Post,
}

/// Durable record of where an entity was last known to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: Uuid,
    pub pipeline: String,
    pub transition: String,
    pub phase: Phase,
    pub list: String,
    pub entity: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new<E: Serialize>(
        key: Uuid,
        pipeline: &str,
        transition: &str,
        phase: Phase,
        list: &str,
        entity: &E,
    ) -> Result<Self> {
        Ok(Self {
            key,
            pipeline: pipeline.to_string(),
            transition: transition.to_string(),
            phase,
            list: list.to_string(),
            entity: serde_json::to_value(entity)?,
            saved_at: Utc::now(),
        })
    }
}

/// Key-value persistence for pipeline checkpoints.
///
/// Every method failing is an infrastructure failure.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn read(&self, key: Uuid) -> Result<Option<Checkpoint>>;

    /// Move the entity's checkpoint out of the active set. Archiving an
    /// unknown key is not an error.
    async fn archive(&self, key: Uuid) -> Result<()>;

    /// All non-archived checkpoints.
    async fn active(&self) -> Result<Vec<Checkpoint>>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    active: Mutex<HashMap<Uuid, Checkpoint>>,
    archived: Mutex<HashMap<Uuid, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn archived(&self, key: Uuid) -> Option<Checkpoint> {
        self.archived.lock().await.get(&key).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.active
            .lock()
            .await
            .insert(checkpoint.key, checkpoint.clone());
        Ok(())
    }

    async fn read(&self, key: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self.active.lock().await.get(&key).cloned())
    }

    async fn archive(&self, key: Uuid) -> Result<()> {
        if let Some(checkpoint) = self.active.lock().await.remove(&key) {
            self.archived.lock().await.insert(key, checkpoint);
        }
        Ok(())
    }

    async fn active(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.active.lock().await.values().cloned().collect())
    }
}

/// One JSON file per entity under `<root>/active`, moved to
/// `<root>/archive` once the entity leaves its pipeline.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    active_dir: PathBuf,
    archive_dir: PathBuf,
}

fn infra(context: &str, path: &Path, e: std::io::Error) -> PlaneError {
    PlaneError::Infrastructure(format!("{} {}: {}", context, path.display(), e))
}

impl FileCheckpointStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let active_dir = root.join("active");
        let archive_dir = root.join("archive");
        for dir in [&active_dir, &archive_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| infra("cannot create", dir, e))?;
        }
        Ok(Self {
            active_dir,
            archive_dir,
        })
    }

    fn active_path(&self, key: Uuid) -> PathBuf {
        self.active_dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.active_path(checkpoint.key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| infra("cannot write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| infra("cannot commit", &path, e))
    }

    async fn read(&self, key: Uuid) -> Result<Option<Checkpoint>> {
        let path = self.active_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(infra("cannot read", &path, e)),
        }
    }

    async fn archive(&self, key: Uuid) -> Result<()> {
        let from = self.active_path(key);
        let to = self.archive_dir.join(format!("{}.json", key));
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(infra("cannot archive", &from, e)),
        }
    }

    async fn active(&self) -> Result<Vec<Checkpoint>> {
        let mut dir = tokio::fs::read_dir(&self.active_dir)
            .await
            .map_err(|e| infra("cannot list", &self.active_dir, e))?;
        let mut checkpoints = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| infra("cannot list", &self.active_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| infra("cannot read", &path, e))?;
            match serde_json::from_slice(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint")
                }
            }
        }
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(key: Uuid, phase: Phase) -> Checkpoint {
        Checkpoint::new(key, "tasks", "launch", phase, "due", &serde_json::json!({"n": 1})).unwrap()
    }

    #[tokio::test]
    async fn file_store_round_trip_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let key = Uuid::new_v4();

        store.save(&checkpoint(key, Phase::Pre)).await.unwrap();
        store.save(&checkpoint(key, Phase::Post)).await.unwrap();
        let read = store.read(key).await.unwrap().unwrap();
        assert_eq!(read.phase, Phase::Post);
        assert_eq!(store.active().await.unwrap().len(), 1);

        store.archive(key).await.unwrap();
        assert!(store.read(key).await.unwrap().is_none());
        assert!(store.active().await.unwrap().is_empty());
        assert!(dir.path().join("archive").join(format!("{}.json", key)).exists());
        // archiving twice is fine
        store.archive(key).await.unwrap();
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = Uuid::new_v4();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.save(&checkpoint(key, Phase::Pre)).await.unwrap();
        }
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, key);
    }

    #[tokio::test]
    async fn memory_store_archive() {
        let store = MemoryCheckpointStore::new();
        let key = Uuid::new_v4();
        store.save(&checkpoint(key, Phase::Post)).await.unwrap();
        store.archive(key).await.unwrap();
        assert!(store.active().await.unwrap().is_empty());
        assert!(store.archived(key).await.is_some());
    }
}
