//! Component C: checksummed, versioned state storage (§4.C).
//!
//! `StateStorage` is the trait the rest of the crate depends on; `MemoryStateStorage`
//! and `FilesystemStateStorage` are the two shipped back-ends. `Serializer` converts
//! arbitrary state to bytes and back, with `JsonSerializer` as the canonical impl.
//! `StreamingStateStorage` wraps any back-end with reader/writer convenience methods
//! by fully buffering internally; no partial-write semantics are promised.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{ForgeError, ForgeResult};
use crate::model::StateVersion;

/// Converts arbitrary state values to bytes and back. The canonical
/// implementation is [`JsonSerializer`].
pub trait Serializer: Send + Sync {
    /// Serialize `value` to bytes.
    fn encode<T: Serialize>(&self, value: &T) -> ForgeResult<Vec<u8>>;
    /// Deserialize bytes back into `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> ForgeResult<T>;
}

/// JSON `Serializer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> ForgeResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> ForgeResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The checksummed, versioned state store contract (§4.C).
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Write `bytes` under `(plugin_id, version)`, recording a metadata record
    /// with length, timestamp, and SHA-256 checksum. The metadata write is
    /// rolled back if the bytes write fails, so the two stay consistent from
    /// the caller's perspective.
    async fn save(&self, plugin_id: &str, version: &str, bytes: Vec<u8>) -> ForgeResult<()>;
    /// Read bytes back, recomputing and verifying the checksum.
    async fn load(&self, plugin_id: &str, version: &str) -> ForgeResult<Vec<u8>>;
    /// List every recorded version for `plugin_id`; empty (not an error) when none exist.
    async fn list(&self, plugin_id: &str) -> ForgeResult<Vec<StateVersion>>;
    /// Remove both artifacts for `(plugin_id, version)`. Idempotent.
    async fn delete(&self, plugin_id: &str, version: &str) -> ForgeResult<()>;
}

#[derive(Clone)]
struct StoredBlob {
    meta: StateVersion,
    bytes: Vec<u8>,
}

/// In-memory `StateStorage`, keyed by `(pluginID, version)`. Always returns
/// defensive copies.
#[derive(Default)]
pub struct MemoryStateStorage {
    blobs: RwLock<HashMap<(String, String), StoredBlob>>,
}

impl MemoryStateStorage {
    /// Construct an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStorage for MemoryStateStorage {
    async fn save(&self, plugin_id: &str, version: &str, bytes: Vec<u8>) -> ForgeResult<()> {
        let meta = StateVersion {
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            timestamp: chrono::Utc::now(),
            size: bytes.len() as u64,
            checksum: sha256_hex(&bytes),
        };
        self.blobs
            .write()
            .await
            .insert((plugin_id.to_string(), version.to_string()), StoredBlob { meta, bytes });
        Ok(())
    }

    async fn load(&self, plugin_id: &str, version: &str) -> ForgeResult<Vec<u8>> {
        let guard = self.blobs.read().await;
        let blob = guard
            .get(&(plugin_id.to_string(), version.to_string()))
            .ok_or_else(|| ForgeError::not_found(format!("state '{plugin_id}' version '{version}'")))?;
        let recomputed = sha256_hex(&blob.bytes);
        if recomputed != blob.meta.checksum {
            return Err(ForgeError::StateIntegrity {
                plugin_id: plugin_id.to_string(),
                version: version.to_string(),
            });
        }
        Ok(blob.bytes.clone())
    }

    async fn list(&self, plugin_id: &str) -> ForgeResult<Vec<StateVersion>> {
        let guard = self.blobs.read().await;
        Ok(guard
            .values()
            .filter(|b| b.meta.plugin_id == plugin_id)
            .map(|b| b.meta.clone())
            .collect())
    }

    async fn delete(&self, plugin_id: &str, version: &str) -> ForgeResult<()> {
        self.blobs
            .write()
            .await
            .remove(&(plugin_id.to_string(), version.to_string()));
        Ok(())
    }
}

/// Filesystem `StateStorage`, rooted at `<base>/<pluginID>/<version>.{meta.json,state}`.
pub struct FilesystemStateStorage {
    base: PathBuf,
}

impl FilesystemStateStorage {
    /// Construct a store rooted at `base`; the directory is created lazily on first write.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.base.join(plugin_id)
    }

    fn meta_path(&self, plugin_id: &str, version: &str) -> PathBuf {
        self.plugin_dir(plugin_id).join(format!("{version}.meta.json"))
    }

    fn state_path(&self, plugin_id: &str, version: &str) -> PathBuf {
        self.plugin_dir(plugin_id).join(format!("{version}.state"))
    }
}

#[async_trait]
impl StateStorage for FilesystemStateStorage {
    async fn save(&self, plugin_id: &str, version: &str, bytes: Vec<u8>) -> ForgeResult<()> {
        let dir = self.plugin_dir(plugin_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ForgeError::io(dir.clone(), e))?;

        let meta = StateVersion {
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            timestamp: chrono::Utc::now(),
            size: bytes.len() as u64,
            checksum: sha256_hex(&bytes),
        };
        let meta_path = self.meta_path(plugin_id, version);
        let state_path = self.state_path(plugin_id, version);

        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        tokio::fs::write(&meta_path, &meta_bytes)
            .await
            .map_err(|e| ForgeError::io(meta_path.clone(), e))?;

        if let Err(e) = tokio::fs::write(&state_path, &bytes).await {
            let _ = tokio::fs::remove_file(&meta_path).await;
            return Err(ForgeError::io(state_path, e));
        }
        Ok(())
    }

    async fn load(&self, plugin_id: &str, version: &str) -> ForgeResult<Vec<u8>> {
        let meta_path = self.meta_path(plugin_id, version);
        let state_path = self.state_path(plugin_id, version);

        let meta_bytes = tokio::fs::read(&meta_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ForgeError::not_found(format!("state '{plugin_id}' version '{version}'"))
            } else {
                ForgeError::io(meta_path.clone(), e)
            }
        })?;
        let meta: StateVersion = serde_json::from_slice(&meta_bytes)?;

        let bytes = tokio::fs::read(&state_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ForgeError::not_found(format!("state '{plugin_id}' version '{version}'"))
            } else {
                ForgeError::io(state_path.clone(), e)
            }
        })?;

        let recomputed = sha256_hex(&bytes);
        if recomputed != meta.checksum {
            return Err(ForgeError::StateIntegrity {
                plugin_id: plugin_id.to_string(),
                version: version.to_string(),
            });
        }
        Ok(bytes)
    }

    async fn list(&self, plugin_id: &str) -> ForgeResult<Vec<StateVersion>> {
        let dir = self.plugin_dir(plugin_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ForgeError::io(dir, e)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForgeError::io(self.plugin_dir(plugin_id), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(meta) = serde_json::from_slice::<StateVersion>(&bytes) {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, plugin_id: &str, version: &str) -> ForgeResult<()> {
        let meta_path = self.meta_path(plugin_id, version);
        let state_path = self.state_path(plugin_id, version);
        let _ = tokio::fs::remove_file(&meta_path).await;
        let _ = tokio::fs::remove_file(&state_path).await;

        let dir = self.plugin_dir(plugin_id);
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            if entries.next_entry().await.ok().flatten().is_none() {
                let _ = tokio::fs::remove_dir(&dir).await;
            }
        }
        Ok(())
    }
}

/// Wraps any [`StateStorage`] with `Serializer`-aware save/load helpers. Fully
/// buffers in memory; no partial-write semantics are promised.
pub struct StreamingStateStorage<S, B> {
    storage: B,
    serializer: S,
}

impl<S: Serializer, B: StateStorage> StreamingStateStorage<S, B> {
    /// Wrap `storage` with `serializer`.
    pub fn new(storage: B, serializer: S) -> Self {
        Self { storage, serializer }
    }

    /// Serialize `value` and save it.
    pub async fn save_value<T: Serialize + Sync>(
        &self,
        plugin_id: &str,
        version: &str,
        value: &T,
    ) -> ForgeResult<()> {
        let bytes = self.serializer.encode(value)?;
        self.storage.save(plugin_id, version, bytes).await
    }

    /// Load and deserialize a value.
    pub async fn load_value<T: DeserializeOwned>(
        &self,
        plugin_id: &str,
        version: &str,
    ) -> ForgeResult<T> {
        let bytes = self.storage.load(plugin_id, version).await?;
        self.serializer.decode(&bytes)
    }
}

/// Convenience re-export of the base directory layout documented in §4.C, used
/// by callers constructing a [`FilesystemStateStorage`] from a `GlobalConfig`.
pub fn layout_hint(base: &Path, plugin_id: &str, version: &str) -> (PathBuf, PathBuf) {
    let dir = base.join(plugin_id);
    (
        dir.join(format!("{version}.meta.json")),
        dir.join(format!("{version}.state")),
    )
}
