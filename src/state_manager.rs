//! Component E: the state manager (§4.E).
//!
//! Thin orchestration layer over [`crate::storage::StateStorage`]: serialize-then-save,
//! load-then-deserialize, version migration through a pluggable `StateMigrator`, and
//! best-effort fleet-wide snapshot/restore. Grounded on `versioning.rs`'s
//! `VersionManifest`/update-bookkeeping shape for how version-aware state tracking
//! reads in this codebase, generalized from plugin-manifest versions to stored-state
//! versions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ForgeError, ForgeResult};
use crate::storage::{JsonSerializer, Serializer, StateStorage};

/// Converts a plugin's stored state from one version's shape to another.
#[async_trait]
pub trait StateMigrator: Send + Sync {
    /// Whether this migrator can handle `from -> to` for its plugin.
    fn can_migrate(&self, from: &str, to: &str) -> bool;
    /// Perform the migration, returning the new version's bytes.
    async fn migrate(&self, from: &str, to: &str, bytes: Vec<u8>) -> ForgeResult<Vec<u8>>;
}

/// Save/load/migrate state, plus best-effort fleet snapshot/restore (§4.E).
pub struct StateManager {
    storage: Arc<dyn StateStorage>,
    serializer: JsonSerializer,
    migrators: std::sync::RwLock<HashMap<String, Arc<dyn StateMigrator>>>,
}

impl StateManager {
    /// Construct a state manager over `storage`, with no migrators registered.
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            storage,
            serializer: JsonSerializer,
            migrators: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the migrator used for `plugin_id`.
    pub fn register_migrator(&self, plugin_id: &str, migrator: Arc<dyn StateMigrator>) {
        self.migrators
            .write()
            .unwrap()
            .insert(plugin_id.to_string(), migrator);
    }

    /// Serialize `value` and save it under `(plugin_id, version)`.
    pub async fn save_state<T: Serialize + Sync>(
        &self,
        plugin_id: &str,
        version: &str,
        value: &T,
    ) -> ForgeResult<()> {
        let bytes = self.serializer.encode(value)?;
        self.storage.save(plugin_id, version, bytes).await
    }

    /// Load and deserialize state for `(plugin_id, version)`.
    pub async fn load_state<T: DeserializeOwned>(
        &self,
        plugin_id: &str,
        version: &str,
    ) -> ForgeResult<T> {
        let bytes = self.storage.load(plugin_id, version).await?;
        self.serializer.decode(&bytes)
    }

    /// Migrate `plugin_id`'s stored state from `from_version` to `to_version`
    /// using its registered `StateMigrator`, saving the result under `to_version`.
    pub async fn migrate_state(
        &self,
        plugin_id: &str,
        from_version: &str,
        to_version: &str,
    ) -> ForgeResult<Vec<u8>> {
        let migrator = {
            let guard = self.migrators.read().unwrap();
            guard.get(plugin_id).cloned()
        };
        let migrator = migrator.ok_or_else(|| ForgeError::MigrationUnsupported {
            plugin_id: plugin_id.to_string(),
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
        })?;
        if !migrator.can_migrate(from_version, to_version) {
            return Err(ForgeError::MigrationUnsupported {
                plugin_id: plugin_id.to_string(),
                from_version: from_version.to_string(),
                to_version: to_version.to_string(),
            });
        }

        let from_bytes = self.storage.load(plugin_id, from_version).await?;
        let migrated = migrator.migrate(from_version, to_version, from_bytes).await?;
        self.storage
            .save(plugin_id, to_version, migrated.clone())
            .await?;
        Ok(migrated)
    }

    /// Save every `(plugin_id, version, bytes)` triple under the `"current"`
    /// tag; best-effort across the fleet, errors on individual plugins are
    /// logged and skipped, the call itself always succeeds.
    pub async fn create_snapshot(&self, plugins: &HashMap<String, Vec<u8>>) -> HashMap<String, Vec<u8>> {
        let mut out = HashMap::with_capacity(plugins.len());
        for (plugin_id, bytes) in plugins {
            if let Err(e) = self.storage.save(plugin_id, "current", bytes.clone()).await {
                tracing::warn!(plugin = %plugin_id, error = %e, "snapshot save failed, skipping");
                continue;
            }
            out.insert(plugin_id.clone(), bytes.clone());
        }
        out
    }

    /// Restore every entry in `snapshot` back into storage under `"current"`;
    /// best-effort, individual failures are logged and skipped.
    pub async fn restore_snapshot(&self, snapshot: &HashMap<String, Vec<u8>>) {
        for (plugin_id, bytes) in snapshot {
            if let Err(e) = self.storage.save(plugin_id, "current", bytes.clone()).await {
                tracing::warn!(plugin = %plugin_id, error = %e, "snapshot restore failed, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStateStorage;

    #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Counter {
        n: u64,
    }

    struct DoubleMigrator;

    #[async_trait]
    impl StateMigrator for DoubleMigrator {
        fn can_migrate(&self, from: &str, to: &str) -> bool {
            from == "1.0.0" && to == "2.0.0"
        }

        async fn migrate(&self, _from: &str, _to: &str, bytes: Vec<u8>) -> ForgeResult<Vec<u8>> {
            let counter: Counter = serde_json::from_slice(&bytes)?;
            Ok(serde_json::to_vec(&Counter { n: counter.n * 2 })?)
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_typed_value() {
        let manager = StateManager::new(Arc::new(MemoryStateStorage::new()));
        manager.save_state("echo", "1.0.0", &Counter { n: 7 }).await.unwrap();
        let loaded: Counter = manager.load_state("echo", "1.0.0").await.unwrap();
        assert_eq!(loaded, Counter { n: 7 });
    }

    #[tokio::test]
    async fn migrate_without_registered_migrator_is_unsupported() {
        let manager = StateManager::new(Arc::new(MemoryStateStorage::new()));
        let err = manager
            .migrate_state("echo", "1.0.0", "2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::MigrationUnsupported { .. }));
    }

    #[tokio::test]
    async fn migrate_applies_migrator_and_saves_target_version() {
        let manager = StateManager::new(Arc::new(MemoryStateStorage::new()));
        manager.save_state("echo", "1.0.0", &Counter { n: 7 }).await.unwrap();
        manager.register_migrator("echo", Arc::new(DoubleMigrator));

        let migrated = manager.migrate_state("echo", "1.0.0", "2.0.0").await.unwrap();
        let counter: Counter = serde_json::from_slice(&migrated).unwrap();
        assert_eq!(counter, Counter { n: 14 });

        let loaded: Counter = manager.load_state("echo", "2.0.0").await.unwrap();
        assert_eq!(loaded, Counter { n: 14 });
    }

    #[tokio::test]
    async fn migrate_rejects_unsupported_range() {
        let manager = StateManager::new(Arc::new(MemoryStateStorage::new()));
        manager.save_state("echo", "1.0.0", &Counter { n: 1 }).await.unwrap();
        manager.register_migrator("echo", Arc::new(DoubleMigrator));

        let err = manager.migrate_state("echo", "1.0.0", "3.0.0").await.unwrap_err();
        assert!(matches!(err, ForgeError::MigrationUnsupported { .. }));
    }

    #[tokio::test]
    async fn snapshot_and_restore_are_best_effort() {
        let manager = StateManager::new(Arc::new(MemoryStateStorage::new()));
        let mut plugins = HashMap::new();
        plugins.insert("echo".to_string(), b"{\"n\":1}".to_vec());
        plugins.insert("relay".to_string(), b"{\"n\":2}".to_vec());

        let snapshot = manager.create_snapshot(&plugins).await;
        assert_eq!(snapshot.len(), 2);

        manager.restore_snapshot(&snapshot).await;
        let loaded: Counter = manager.load_state("echo", "current").await.unwrap();
        assert_eq!(loaded, Counter { n: 1 });
    }
}
