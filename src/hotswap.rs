//! Component F: the hot-swap coordinator (§4.F).
//!
//! Performs a zero-downtime update of a named plugin to a new `PluginSpec`,
//! threading through checkpoint/rollback, state export/migrate/import, and a
//! drain step, failing fast at each phase and rolling back on any abort. The
//! multi-step async orchestration with a status-record map and a background
//! cleanup task is grounded on `hotreload.rs`'s watch/debounce/reload loop,
//! generalized here from file-watch reload to the full swap/rollback algorithm.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::checkpoint::CheckpointManager;
use crate::config::Configuration;
use crate::error::{ForgeError, ForgeResult};
use crate::mesh::Mesh;
use crate::model::{HotSwapStatus, PluginInfo, PluginSpec, SourceKind};
use crate::state_manager::StateManager;
use crate::supervisor::Supervisor;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The collaborator the coordinator drives to actually load/start/stop/unload
/// plugin instances. A real deployment backs this with the supervisor and
/// registry together; tests use an in-memory double so unit tests never spawn
/// real subprocesses (DESIGN.md Open Question 3).
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Fetch the currently registered `PluginInfo` for `plugin_id`.
    async fn get_info(&self, plugin_id: &str) -> ForgeResult<PluginInfo>;
    /// Load (but do not start) `spec`'s artifact as the staged new version for `plugin_id`.
    async fn load(&self, plugin_id: &str, spec: &PluginSpec) -> ForgeResult<()>;
    /// Export state from the currently active instance of `plugin_id`.
    async fn export_state(&self, plugin_id: &str) -> ForgeResult<Vec<u8>>;
    /// Import state into the staged new instance of `plugin_id`.
    async fn import_state(&self, plugin_id: &str, bytes: Vec<u8>) -> ForgeResult<()>;
    /// Wait up to `timeout` for pending requests against the active instance to finish.
    async fn drain_requests(&self, plugin_id: &str, timeout: Duration) -> ForgeResult<()>;
    /// Stop the currently active instance of `plugin_id`.
    async fn stop(&self, plugin_id: &str) -> ForgeResult<()>;
    /// Start the staged instance of `plugin_id`, promoting it to active.
    async fn start(&self, plugin_id: &str) -> ForgeResult<()>;
    /// Discard the non-active (old or staged, depending on phase) instance of `plugin_id`.
    async fn unload(&self, plugin_id: &str) -> ForgeResult<()>;
}

/// Production `ProcessManager`, driving a real [`Supervisor`] over the
/// dispatcher's JSON-RPC contract.
///
/// `Supervisor` keys a process by a single literal name, but a hot-swap needs
/// two OS processes alive for one logical `plugin_id` at once (the running
/// old version and the staged new one). This manager resolves that by
/// spawning the staged version under a generated `"{plugin_id}@swap{n}"`
/// name and tracking three small maps: `staged` (plugin_id -> not-yet-started
/// staged name, present between `load` and `start`), `active` (plugin_id ->
/// the supervisor name currently serving traffic, defaulting to the bare
/// `plugin_id` until a swap promotes something else), and `previous`
/// (plugin_id -> the just-displaced name, present between `start` and
/// `unload` so `unload` knows what to tear down).
pub struct SupervisorProcessManager {
    supervisor: Arc<Supervisor>,
    configuration: Arc<dyn Configuration>,
    mesh: Arc<Mesh>,
    staged: Mutex<HashMap<String, String>>,
    active: Mutex<HashMap<String, String>>,
    previous: Mutex<HashMap<String, String>>,
    swap_counter: AtomicU64,
}

impl SupervisorProcessManager {
    /// Construct a process manager driving `supervisor`, reading per-service
    /// configuration through `configuration`, and registering promoted
    /// instances on `mesh`.
    pub fn new(supervisor: Arc<Supervisor>, configuration: Arc<dyn Configuration>, mesh: Arc<Mesh>) -> Self {
        Self {
            supervisor,
            configuration,
            mesh,
            staged: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            previous: Mutex::new(HashMap::new()),
            swap_counter: AtomicU64::new(0),
        }
    }

    async fn active_name(&self, plugin_id: &str) -> String {
        self.active
            .lock()
            .await
            .get(plugin_id)
            .cloned()
            .unwrap_or_else(|| plugin_id.to_string())
    }
}

#[async_trait]
impl ProcessManager for SupervisorProcessManager {
    async fn get_info(&self, plugin_id: &str) -> ForgeResult<PluginInfo> {
        let name = self.active_name(plugin_id).await;
        let value = self.supervisor.call(&name, "getinfo", Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn load(&self, plugin_id: &str, spec: &PluginSpec) -> ForgeResult<()> {
        let staged_name = format!("{plugin_id}@swap{}", self.swap_counter.fetch_add(1, Ordering::SeqCst));

        let mut svc = self.configuration.get_service_config(plugin_id)?;
        if spec.source.kind == SourceKind::Local {
            svc.binary_path = PathBuf::from(&spec.source.path);
        }
        self.configuration.set_service_config(&staged_name, svc)?;

        self.supervisor.spawn(&staged_name).await?;
        self.supervisor
            .call(&staged_name, "initialize", serde_json::json!({"version": spec.version}))
            .await?;

        self.staged.lock().await.insert(plugin_id.to_string(), staged_name);
        Ok(())
    }

    async fn export_state(&self, plugin_id: &str) -> ForgeResult<Vec<u8>> {
        let name = self.active_name(plugin_id).await;
        let value = self.supervisor.call(&name, "export_state", Value::Null).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| ForgeError::Other(format!("'{name}' export_state did not return a hex string")))?;
        hex::decode(encoded).map_err(|e| ForgeError::Other(format!("invalid export_state hex from '{name}': {e}")))
    }

    async fn import_state(&self, plugin_id: &str, bytes: Vec<u8>) -> ForgeResult<()> {
        let staged_name = self
            .staged
            .lock()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| ForgeError::not_found(format!("staged instance for '{plugin_id}'")))?;
        self.supervisor
            .call(&staged_name, "import_state", Value::String(hex::encode(bytes)))
            .await?;
        Ok(())
    }

    async fn drain_requests(&self, _plugin_id: &str, timeout: Duration) -> ForgeResult<()> {
        // No request-counting path exists yet between the mesh and a
        // supervised plugin's stdio connection (DESIGN.md Open Question 4);
        // this approximates "wait for pending requests" with a bounded grace
        // window, same as the in-memory test double. The drain step in
        // `run_swap` already treats a timeout here as non-fatal.
        tokio::time::sleep(timeout.min(Duration::from_secs(2))).await;
        Ok(())
    }

    async fn stop(&self, plugin_id: &str) -> ForgeResult<()> {
        let name = self.active_name(plugin_id).await;
        self.supervisor.stop(&name).await
    }

    async fn start(&self, plugin_id: &str) -> ForgeResult<()> {
        let staged_name = self
            .staged
            .lock()
            .await
            .remove(plugin_id)
            .ok_or_else(|| ForgeError::not_found(format!("staged instance for '{plugin_id}'")))?;

        self.supervisor.call(&staged_name, "start", Value::Null).await?;

        let old_active = self.active_name(plugin_id).await;
        self.active.lock().await.insert(plugin_id.to_string(), staged_name.clone());
        self.previous.lock().await.insert(plugin_id.to_string(), old_active);
        let _ = self.mesh.register_service(plugin_id, &staged_name);
        Ok(())
    }

    async fn unload(&self, plugin_id: &str) -> ForgeResult<()> {
        if let Some(staged_name) = self.staged.lock().await.remove(plugin_id) {
            let _ = self.supervisor.stop(&staged_name).await;
            return Ok(());
        }
        if let Some(previous_name) = self.previous.lock().await.remove(plugin_id) {
            let _ = self.supervisor.stop(&previous_name).await;
        }
        Ok(())
    }
}

/// Drives a single plugin's update through the twelve-step algorithm.
pub struct HotSwapCoordinator {
    process_manager: Arc<dyn ProcessManager>,
    checkpoints: Arc<dyn CheckpointManager>,
    state_manager: Arc<StateManager>,
    statuses: RwLock<HashMap<String, HotSwapStatus>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HotSwapCoordinator {
    /// Construct a coordinator over the given collaborators.
    pub fn new(
        process_manager: Arc<dyn ProcessManager>,
        checkpoints: Arc<dyn CheckpointManager>,
        state_manager: Arc<StateManager>,
    ) -> Self {
        Self {
            process_manager,
            checkpoints,
            state_manager,
            statuses: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Current status record for `plugin_id`, if a swap has ever been started.
    pub async fn status(&self, plugin_id: &str) -> Option<HotSwapStatus> {
        self.statuses.read().await.get(plugin_id).cloned()
    }

    async fn lock_for(&self, plugin_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(plugin_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_phase(&self, plugin_id: &str, phase: &str) {
        let mut guard = self.statuses.write().await;
        if let Some(status) = guard.get_mut(plugin_id) {
            status.status = phase.to_string();
        }
    }

    /// Swap `plugin_id` to `new_spec`. One active swap per `plugin_id`;
    /// concurrent swaps of different plugins are permitted (enforced by a
    /// per-plugin lock rather than a single global one).
    pub async fn swap(&self, plugin_id: &str, new_spec: PluginSpec) -> ForgeResult<()> {
        let plugin_lock = self.lock_for(plugin_id).await;
        let _guard = plugin_lock.lock().await;

        self.statuses.write().await.insert(
            plugin_id.to_string(),
            HotSwapStatus {
                plugin_id: plugin_id.to_string(),
                old_version: String::new(),
                new_version: new_spec.version.clone(),
                status: "initializing".to_string(),
                start_time: Utc::now(),
                end_time: None,
                error: None,
                checkpoint_id: None,
            },
        );

        match self.run_swap(plugin_id, &new_spec).await {
            Ok(()) => {
                self.finish(plugin_id, "completed", None).await;
                Ok(())
            }
            Err(primary) => {
                let checkpoint_id = self.statuses.read().await.get(plugin_id).and_then(|s| s.checkpoint_id);
                self.set_phase(plugin_id, "rolling_back").await;

                let combined = if let Some(checkpoint_id) = checkpoint_id {
                    match self.checkpoints.rollback(plugin_id, checkpoint_id).await {
                        Ok(()) => primary.to_string(),
                        Err(rollback_err) => format!("{primary}; rollback also failed: {rollback_err}"),
                    }
                } else {
                    primary.to_string()
                };

                self.finish(plugin_id, "failed", Some(combined.clone())).await;
                Err(ForgeError::HotSwapFailed {
                    plugin_id: plugin_id.to_string(),
                    phase: "swap".to_string(),
                    cause: primary.to_string(),
                    rollback_cause: if combined == primary.to_string() {
                        None
                    } else {
                        Some(combined)
                    },
                })
            }
        }
    }

    async fn finish(&self, plugin_id: &str, status: &str, error: Option<String>) {
        let mut guard = self.statuses.write().await;
        if let Some(record) = guard.get_mut(plugin_id) {
            record.status = status.to_string();
            record.end_time = Some(Utc::now());
            record.error = error;
        }
    }

    async fn run_swap(&self, plugin_id: &str, new_spec: &PluginSpec) -> ForgeResult<()> {
        // Step 2: fetch the old PluginInfo.
        let old_info = self.process_manager.get_info(plugin_id).await?;
        {
            let mut guard = self.statuses.write().await;
            if let Some(record) = guard.get_mut(plugin_id) {
                record.old_version = old_info.version.clone();
            }
        }

        // Step 3: checkpoint current state.
        self.set_phase(plugin_id, "creating_checkpoint").await;
        let checkpoint_id = self.checkpoints.create_checkpoint(plugin_id).await?;
        {
            let mut guard = self.statuses.write().await;
            if let Some(record) = guard.get_mut(plugin_id) {
                record.checkpoint_id = Some(checkpoint_id);
            }
        }

        // Step 4: load the new version without stopping the old.
        self.set_phase(plugin_id, "loading_new_version").await;
        self.process_manager.load(plugin_id, new_spec).await?;

        // Step 5: export state from the old plugin.
        self.set_phase(plugin_id, "exporting_state").await;
        let exported = match self.process_manager.export_state(plugin_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = self.process_manager.unload(plugin_id).await;
                return Err(e);
            }
        };

        // Step 6: migrate if the version actually changed.
        let mut state_to_import = exported;
        if old_info.version != new_spec.version {
            self.set_phase(plugin_id, "migrating_state").await;
            match self
                .state_manager
                .migrate_state(plugin_id, &old_info.version, &new_spec.version)
                .await
            {
                Ok(migrated) => state_to_import = migrated,
                Err(e) => {
                    let _ = self.process_manager.unload(plugin_id).await;
                    return Err(e);
                }
            }
        }

        // Step 7: drain pending requests; timeout is not fatal.
        self.set_phase(plugin_id, "draining_requests").await;
        if let Err(e) = self
            .process_manager
            .drain_requests(plugin_id, DRAIN_TIMEOUT)
            .await
        {
            tracing::warn!(plugin = %plugin_id, error = %e, "drain did not complete before timeout, proceeding anyway");
        }

        // Step 8: stop the old plugin.
        self.set_phase(plugin_id, "stopping_old_version").await;
        if let Err(e) = self.process_manager.stop(plugin_id).await {
            let _ = self.process_manager.unload(plugin_id).await;
            return Err(e);
        }

        // Step 9: start the new plugin. The old instance is already stopped
        // (step 8) and `start` only promotes the staged instance, so there is
        // no "restart the old version" call available here; a failure at
        // this point is reported as a swap failure and the caller's rollback
        // (via the checkpoint taken in step 3) is what actually restores
        // service, not this coordinator.
        self.set_phase(plugin_id, "starting_new_version").await;
        if let Err(e) = self.process_manager.start(plugin_id).await {
            let _ = self.process_manager.unload(plugin_id).await;
            return Err(e);
        }

        // Step 10: import state into the new plugin. Same reasoning as step 9:
        // nothing here can resurrect the old instance, so just unload the
        // failed new one and surface the error.
        self.set_phase(plugin_id, "importing_state").await;
        if let Err(e) = self
            .process_manager
            .import_state(plugin_id, state_to_import)
            .await
        {
            let _ = self.process_manager.stop(plugin_id).await;
            let _ = self.process_manager.unload(plugin_id).await;
            return Err(e);
        }

        // Step 11: unload the old plugin; non-fatal.
        self.set_phase(plugin_id, "unloading_old_version").await;
        if let Err(e) = self.process_manager.unload(plugin_id).await {
            tracing::warn!(plugin = %plugin_id, error = %e, "unloading old version failed, continuing");
        }

        // Step 12: clean up the checkpoint.
        if let Err(e) = self.checkpoints.cleanup_checkpoint(checkpoint_id).await {
            tracing::warn!(plugin = %plugin_id, error = %e, "checkpoint cleanup failed, continuing");
        }

        Ok(())
    }

    /// Remove terminal status records older than `max_age`. Intended to be
    /// driven by [`spawn_janitor`] on an interval.
    pub async fn cleanup_terminal(&self, max_age: chrono::Duration) {
        let cutoff = Utc::now() - max_age;
        self.statuses.write().await.retain(|_, status| {
            !status.is_terminal() || status.end_time.map(|t| t >= cutoff).unwrap_or(true)
        });
    }
}

/// Spawn a background task that periodically removes terminal `HotSwapStatus`
/// records older than `max_age`, checked every `interval`.
pub fn spawn_janitor(
    coordinator: Arc<HotSwapCoordinator>,
    interval: Duration,
    max_age: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            coordinator.cleanup_terminal(max_age).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointManager;
    use crate::model::{Isolation, PluginSource, PluginStatus, ResourceSpec, SourceKind};
    use crate::storage::MemoryStateStorage;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_spec(version: &str) -> PluginSpec {
        PluginSpec {
            name: "echo".to_string(),
            version: version.to_string(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            source: PluginSource {
                kind: SourceKind::Local,
                path: "echo/echo".to_string(),
            },
            isolation: Isolation::Process,
            capabilities: vec![],
            permissions: vec![],
            resources: ResourceSpec::default(),
            dependencies: vec![],
            extra: HashMap::new(),
        }
    }

    struct MockProcessManager {
        active_version: std::sync::Mutex<String>,
        fail_start: AtomicBool,
    }

    #[async_trait]
    impl ProcessManager for MockProcessManager {
        async fn get_info(&self, plugin_id: &str) -> ForgeResult<PluginInfo> {
            Ok(PluginInfo {
                name: plugin_id.to_string(),
                version: self.active_version.lock().unwrap().clone(),
                metadata: HashMap::new(),
                capabilities: vec![],
                status: PluginStatus::Running,
                load_time: Utc::now(),
                uptime_secs: 0,
            })
        }

        async fn load(&self, _plugin_id: &str, _spec: &PluginSpec) -> ForgeResult<()> {
            Ok(())
        }

        async fn export_state(&self, _plugin_id: &str) -> ForgeResult<Vec<u8>> {
            Ok(b"{\"n\":1}".to_vec())
        }

        async fn import_state(&self, _plugin_id: &str, _bytes: Vec<u8>) -> ForgeResult<()> {
            Ok(())
        }

        async fn drain_requests(&self, _plugin_id: &str, _timeout: Duration) -> ForgeResult<()> {
            Ok(())
        }

        async fn stop(&self, _plugin_id: &str) -> ForgeResult<()> {
            Ok(())
        }

        async fn start(&self, _plugin_id: &str) -> ForgeResult<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ForgeError::ProcessError {
                    service: "echo".to_string(),
                    cause: "simulated start failure".to_string(),
                    exit_code: 1,
                });
            }
            *self.active_version.lock().unwrap() = "2.0.0".to_string();
            Ok(())
        }

        async fn unload(&self, _plugin_id: &str) -> ForgeResult<()> {
            Ok(())
        }
    }

    fn coordinator(fail_start: bool) -> HotSwapCoordinator {
        let storage = Arc::new(MemoryStateStorage::new());
        let checkpoints = Arc::new(MemoryCheckpointManager::new(storage.clone()));
        let state_manager = Arc::new(StateManager::new(storage));
        let process_manager = Arc::new(MockProcessManager {
            active_version: std::sync::Mutex::new("1.0.0".to_string()),
            fail_start: AtomicBool::new(fail_start),
        });
        HotSwapCoordinator::new(process_manager, checkpoints, state_manager)
    }

    #[tokio::test]
    async fn successful_swap_reaches_completed() {
        let coordinator = coordinator(false);
        coordinator.swap("echo", test_spec("2.0.0")).await.unwrap();

        let status = coordinator.status("echo").await.unwrap();
        assert_eq!(status.status, "completed");
        assert_eq!(status.old_version, "1.0.0");
        assert_eq!(status.new_version, "2.0.0");
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn failed_start_rolls_back_and_reports_failed() {
        let coordinator = coordinator(true);
        let err = coordinator.swap("echo", test_spec("2.0.0")).await.unwrap_err();
        assert!(matches!(err, ForgeError::HotSwapFailed { .. }));

        let status = coordinator.status("echo").await.unwrap();
        assert_eq!(status.status, "failed");
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn janitor_removes_old_terminal_records() {
        let coordinator = Arc::new(coordinator(false));
        coordinator.swap("echo", test_spec("2.0.0")).await.unwrap();

        coordinator.cleanup_terminal(chrono::Duration::seconds(-1)).await;
        assert!(coordinator.status("echo").await.is_none());
    }
}
