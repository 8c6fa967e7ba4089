//! Component D: the rollback/checkpoint manager (§4.D).
//!
//! Checkpoints are immutable once written. Two back-ends are provided: an
//! in-memory map and a filesystem store writing one `.meta.json`/`.state` pair
//! per checkpoint, mirroring the layout `storage.rs` uses for state blobs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ForgeError, ForgeResult};
use crate::model::Checkpoint;
use crate::storage::StateStorage;

/// The rollback/checkpoint manager contract (§4.D).
#[async_trait]
pub trait CheckpointManager: Send + Sync {
    /// Snapshot the version tagged `"current"` (or `{}` if absent) and return a fresh checkpoint id.
    async fn create_checkpoint(&self, plugin_id: &str) -> ForgeResult<Uuid>;
    /// Restore `checkpoint_id`'s captured state back into storage under its recorded version.
    async fn rollback(&self, plugin_id: &str, checkpoint_id: Uuid) -> ForgeResult<()>;
    /// Idempotently delete a checkpoint; missing files are not errors.
    async fn cleanup_checkpoint(&self, checkpoint_id: Uuid) -> ForgeResult<()>;
    /// Remove every checkpoint older than `now - max_age`.
    async fn cleanup_old_checkpoints(&self, max_age: chrono::Duration) -> ForgeResult<()>;
}

const CURRENT_VERSION_TAG: &str = "current";

/// In-memory checkpoint store.
pub struct MemoryCheckpointManager {
    storage: Arc<dyn StateStorage>,
    checkpoints: RwLock<HashMap<Uuid, Checkpoint>>,
}

impl MemoryCheckpointManager {
    /// Construct a checkpoint manager snapshotting from `storage`.
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            storage,
            checkpoints: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CheckpointManager for MemoryCheckpointManager {
    async fn create_checkpoint(&self, plugin_id: &str) -> ForgeResult<Uuid> {
        let state = match self.storage.load(plugin_id, CURRENT_VERSION_TAG).await {
            Ok(bytes) => bytes,
            Err(ForgeError::NotFound { .. }) => b"{}".to_vec(),
            Err(e) => return Err(e),
        };
        let id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert("version".to_string(), CURRENT_VERSION_TAG.to_string());
        let checkpoint = Checkpoint {
            id,
            plugin_id: plugin_id.to_string(),
            timestamp: Utc::now(),
            state,
            metadata,
        };
        self.checkpoints.write().await.insert(id, checkpoint);
        Ok(id)
    }

    async fn rollback(&self, plugin_id: &str, checkpoint_id: Uuid) -> ForgeResult<()> {
        let checkpoint = self
            .checkpoints
            .read()
            .await
            .get(&checkpoint_id)
            .cloned()
            .ok_or_else(|| ForgeError::not_found(format!("checkpoint '{checkpoint_id}'")))?;
        if checkpoint.plugin_id != plugin_id {
            return Err(ForgeError::invalid_spec(format!(
                "checkpoint '{checkpoint_id}' belongs to plugin '{}', not '{plugin_id}'",
                checkpoint.plugin_id
            )));
        }
        let version = checkpoint
            .metadata
            .get("version")
            .cloned()
            .unwrap_or_else(|| CURRENT_VERSION_TAG.to_string());
        self.storage.save(plugin_id, &version, checkpoint.state).await
    }

    async fn cleanup_checkpoint(&self, checkpoint_id: Uuid) -> ForgeResult<()> {
        self.checkpoints.write().await.remove(&checkpoint_id);
        Ok(())
    }

    async fn cleanup_old_checkpoints(&self, max_age: chrono::Duration) -> ForgeResult<()> {
        let cutoff = Utc::now() - max_age;
        self.checkpoints
            .write()
            .await
            .retain(|_, c| c.timestamp >= cutoff);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    id: Uuid,
    plugin_id: String,
    timestamp: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

/// Filesystem checkpoint store, one `.meta.json`/`.state` pair per checkpoint.
pub struct FilesystemCheckpointManager {
    storage: Arc<dyn StateStorage>,
    base: PathBuf,
}

impl FilesystemCheckpointManager {
    /// Construct a checkpoint manager rooted at `base`, snapshotting from `storage`.
    pub fn new(storage: Arc<dyn StateStorage>, base: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            base: base.into(),
        }
    }

    fn meta_path(&self, id: Uuid) -> PathBuf {
        self.base.join(format!("{id}.meta.json"))
    }

    fn state_path(&self, id: Uuid) -> PathBuf {
        self.base.join(format!("{id}.state"))
    }

    async fn read_meta(&self, id: Uuid) -> ForgeResult<CheckpointMeta> {
        let path = self.meta_path(id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ForgeError::not_found(format!("checkpoint '{id}'"))
            } else {
                ForgeError::io(path.clone(), e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CheckpointManager for FilesystemCheckpointManager {
    async fn create_checkpoint(&self, plugin_id: &str) -> ForgeResult<Uuid> {
        let state = match self.storage.load(plugin_id, CURRENT_VERSION_TAG).await {
            Ok(bytes) => bytes,
            Err(ForgeError::NotFound { .. }) => b"{}".to_vec(),
            Err(e) => return Err(e),
        };

        tokio::fs::create_dir_all(&self.base)
            .await
            .map_err(|e| ForgeError::io(self.base.clone(), e))?;

        let id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert("version".to_string(), CURRENT_VERSION_TAG.to_string());
        let meta = CheckpointMeta {
            id,
            plugin_id: plugin_id.to_string(),
            timestamp: Utc::now(),
            metadata,
        };

        let meta_path = self.meta_path(id);
        let state_path = self.state_path(id);
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .await
            .map_err(|e| ForgeError::io(meta_path.clone(), e))?;
        if let Err(e) = tokio::fs::write(&state_path, &state).await {
            let _ = tokio::fs::remove_file(&meta_path).await;
            return Err(ForgeError::io(state_path, e));
        }
        Ok(id)
    }

    async fn rollback(&self, plugin_id: &str, checkpoint_id: Uuid) -> ForgeResult<()> {
        let meta = self.read_meta(checkpoint_id).await?;
        if meta.plugin_id != plugin_id {
            return Err(ForgeError::invalid_spec(format!(
                "checkpoint '{checkpoint_id}' belongs to plugin '{}', not '{plugin_id}'",
                meta.plugin_id
            )));
        }
        let state_path = self.state_path(checkpoint_id);
        let state = tokio::fs::read(&state_path)
            .await
            .map_err(|e| ForgeError::io(state_path, e))?;
        let version = meta
            .metadata
            .get("version")
            .cloned()
            .unwrap_or_else(|| CURRENT_VERSION_TAG.to_string());
        self.storage.save(plugin_id, &version, state).await
    }

    async fn cleanup_checkpoint(&self, checkpoint_id: Uuid) -> ForgeResult<()> {
        let _ = tokio::fs::remove_file(self.meta_path(checkpoint_id)).await;
        let _ = tokio::fs::remove_file(self.state_path(checkpoint_id)).await;
        Ok(())
    }

    async fn cleanup_old_checkpoints(&self, max_age: chrono::Duration) -> ForgeResult<()> {
        let cutoff = Utc::now() - max_age;
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ForgeError::io(self.base.clone(), e)),
        };

        let mut stale = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForgeError::io(self.base.clone(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(meta) = serde_json::from_slice::<CheckpointMeta>(&bytes) {
                    if meta.timestamp < cutoff {
                        stale.push(meta.id);
                    }
                }
            }
        }
        for id in stale {
            self.cleanup_checkpoint(id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStateStorage;

    #[tokio::test]
    async fn checkpoint_then_rollback_restores_state() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        storage.save("echo", "current", b"{\"n\":1}".to_vec()).await.unwrap();

        let manager = MemoryCheckpointManager::new(storage.clone());
        let id = manager.create_checkpoint("echo").await.unwrap();

        storage.save("echo", "current", b"{\"n\":2}".to_vec()).await.unwrap();
        manager.rollback("echo", id).await.unwrap();

        let restored = storage.load("echo", "current").await.unwrap();
        assert_eq!(restored, b"{\"n\":1}");
    }

    #[tokio::test]
    async fn checkpoint_with_no_current_state_snapshots_empty_object() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        let manager = MemoryCheckpointManager::new(storage.clone());
        let id = manager.create_checkpoint("echo").await.unwrap();

        manager.rollback("echo", id).await.unwrap();
        let restored = storage.load("echo", "current").await.unwrap();
        assert_eq!(restored, b"{}");
    }

    #[tokio::test]
    async fn rollback_rejects_mismatched_plugin() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        let manager = MemoryCheckpointManager::new(storage);
        let id = manager.create_checkpoint("echo").await.unwrap();

        let err = manager.rollback("other", id).await.unwrap_err();
        assert!(matches!(err, ForgeError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn cleanup_checkpoint_is_idempotent() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        let manager = MemoryCheckpointManager::new(storage);
        let id = manager.create_checkpoint("echo").await.unwrap();

        manager.cleanup_checkpoint(id).await.unwrap();
        manager.cleanup_checkpoint(id).await.unwrap();

        let err = manager.rollback("echo", id).await.unwrap_err();
        assert!(matches!(err, ForgeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn filesystem_checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStateStorage::new());
        storage.save("echo", "current", b"hello".to_vec()).await.unwrap();

        let manager = FilesystemCheckpointManager::new(storage.clone(), dir.path());
        let id = manager.create_checkpoint("echo").await.unwrap();

        storage.save("echo", "current", b"goodbye".to_vec()).await.unwrap();
        manager.rollback("echo", id).await.unwrap();

        let restored = storage.load("echo", "current").await.unwrap();
        assert_eq!(restored, b"hello");
    }
}
