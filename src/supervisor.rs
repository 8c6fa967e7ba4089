//! Component A: Process Executor & Supervisor.
//!
//! Spawns plugin binaries as isolated OS processes, streams their output to the
//! logger, detects exit, and enforces an auto-restart policy with exponential
//! backoff. Grounded on the process-manager/supervisor shape used elsewhere in
//! this codebase for subprocess-based plugin hosts, adapted to the state
//! machine and signal-group semantics this spec calls for.
//!
//! The running `Child` is owned exclusively by its supervision task; every
//! other caller (`stop`, `restart`) talks to that task through a small control
//! channel instead of locking the child directly, so no lock is ever held
//! across a subprocess wait (§5).
//!
//! Each child's stdout is dedicated entirely to the line-framed JSON-RPC
//! contract `dispatcher.rs` defines on the plugin side (§4.B); a request
//! writer owns stdin, a response reader owns stdout, and both communicate
//! through a `pending` map keyed by request id, so `call()` can be invoked
//! concurrently from any number of callers without serializing on a lock that
//! spans the round trip. stderr remains a plain forwarded log stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::config::Configuration;
use crate::error::{ForgeError, ForgeResult};
use crate::model::ServiceState;

const MAX_RESTARTS: u32 = 10;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// The supervisor's view of a running plugin (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProcess {
    /// Plugin/service name.
    pub name: String,
    /// OS process id, if currently running.
    pub pid: Option<u32>,
    /// Current supervision state.
    pub state: ServiceState,
    /// When the process was last spawned.
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Consecutive restart count carried across `Restart` calls.
    pub restarts: u32,
    /// Last recorded error, if any.
    pub last_error: Option<String>,
}

impl ServiceProcess {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            state: ServiceState::Stopped,
            start_time: None,
            restarts: 0,
            last_error: None,
        }
    }
}

/// Events emitted by the supervisor as a plugin's process state changes.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// `service` transitioned to `state`.
    StateChanged {
        /// Service name.
        service: String,
        /// New state.
        state: ServiceState,
    },
}

enum ControlMsg {
    Stop {
        shutdown_timeout: Duration,
        ack: oneshot::Sender<()>,
    },
}

/// A pending JSON-RPC call, handed to a child's stdin-writer task.
struct RpcCall {
    method: String,
    params: Value,
    respond_to: oneshot::Sender<ForgeResult<Value>>,
}

#[derive(Debug, Deserialize)]
struct RpcWireResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcWireError>,
}

#[derive(Debug, Deserialize)]
struct RpcWireError {
    code: i64,
    message: String,
}

type PendingRpc = Arc<StdMutex<HashMap<u64, oneshot::Sender<ForgeResult<Value>>>>>;

/// Spawns and supervises plugin subprocesses.
pub struct Supervisor {
    processes: Arc<RwLock<HashMap<String, ServiceProcess>>>,
    controls: Arc<RwLock<HashMap<String, mpsc::Sender<ControlMsg>>>>,
    rpc: Arc<RwLock<HashMap<String, mpsc::Sender<RpcCall>>>>,
    configuration: Arc<dyn Configuration>,
    shutting_down: Arc<AtomicBool>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Construct a supervisor reading service/global configuration through `configuration`.
    pub fn new(configuration: Arc<dyn Configuration>) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            controls: Arc::new(RwLock::new(HashMap::new())),
            rpc: Arc::new(RwLock::new(HashMap::new())),
            configuration,
            shutting_down: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Spawn `name`'s binary per its `ServiceConfig` and begin supervising it.
    pub async fn spawn(&self, name: &str) -> ForgeResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ForgeError::Other(format!(
                "supervisor is shutting down, refusing to spawn '{name}'"
            )));
        }

        let global = self.configuration.get_global_config()?;
        let svc = self.configuration.get_service_config(name)?;

        tokio::fs::create_dir_all(&svc.data_dir)
            .await
            .map_err(|e| ForgeError::io(svc.data_dir.clone(), e))?;

        let binary_path = if svc.binary_path.is_absolute() {
            svc.binary_path.clone()
        } else {
            global.services_dir.join(name).join(&svc.binary_path)
        };

        self.set_process(name, |p| {
            p.state = ServiceState::Starting;
            p.last_error = None;
        })
        .await;
        self.emit(name, ServiceState::Starting);

        let mut cmd = Command::new(&binary_path);
        cmd.arg("--service").arg(name);
        cmd.args(&svc.args);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", &svc.data_dir);
        cmd.env("TEMP", std::env::temp_dir());
        cmd.env("TMP", std::env::temp_dir());
        for (k, v) in &svc.env {
            cmd.env(k, v);
        }
        if svc.resources.max_memory_bytes > 0 {
            cmd.env(
                "FORGE_MEMORY_LIMIT_BYTES",
                svc.resources.max_memory_bytes.to_string(),
            );
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group so signals can address the whole child tree.
            cmd.process_group(0);
        }

        let spawn_result = cmd.spawn().map_err(|e| ForgeError::ProcessError {
            service: name.to_string(),
            cause: format!("failed to start '{}': {e}", binary_path.display()),
            exit_code: -1,
        });
        let mut child = match spawn_result {
            Ok(c) => c,
            Err(e) => {
                self.set_process(name, |p| {
                    p.state = ServiceState::Failed;
                    p.last_error = Some(e.to_string());
                })
                .await;
                self.emit(name, ServiceState::Failed);
                return Err(e);
            }
        };

        let pid = child.id();
        let pending: PendingRpc = Arc::new(StdMutex::new(HashMap::new()));
        if let Some(stdin) = child.stdin.take() {
            if let Some(stdout) = child.stdout.take() {
                let (call_tx, call_rx) = mpsc::channel(32);
                spawn_rpc_writer(name.to_string(), stdin, call_rx, pending.clone());
                spawn_rpc_reader(name.to_string(), stdout, pending.clone());
                self.rpc.write().await.insert(name.to_string(), call_tx);
            }
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_forwarder(name.to_string(), "stderr", stderr);
        }

        let (control_tx, control_rx) = mpsc::channel(4);
        self.controls
            .write()
            .await
            .insert(name.to_string(), control_tx);

        self.set_process(name, |p| {
            p.pid = pid;
            p.state = ServiceState::Running;
            p.start_time = Some(chrono::Utc::now());
        })
        .await;
        self.emit(name, ServiceState::Running);

        self.spawn_supervision_task(name.to_string(), child, control_rx, svc.auto_restart);

        Ok(())
    }

    /// Issue a JSON-RPC request to `name`'s live child over its stdin/stdout
    /// pipe, returning the matching `result` value or an error built from the
    /// matching `error` object (§4.B wire shape). Fails immediately if `name`
    /// has no live rpc channel (never spawned, or its stdio pipes were lost).
    pub async fn call(&self, name: &str, method: &str, params: Value) -> ForgeResult<Value> {
        let call_tx = self.rpc.read().await.get(name).cloned();
        let call_tx = call_tx.ok_or_else(|| ForgeError::not_found(format!("rpc channel for '{name}'")))?;

        let (respond_to, response) = oneshot::channel();
        call_tx
            .send(RpcCall {
                method: method.to_string(),
                params,
                respond_to,
            })
            .await
            .map_err(|_| ForgeError::Other(format!("rpc writer for '{name}' is gone")))?;

        response
            .await
            .map_err(|_| ForgeError::Other(format!("rpc writer for '{name}' dropped the request")))?
    }

    fn spawn_supervision_task(
        &self,
        name: String,
        mut child: tokio::process::Child,
        mut control_rx: mpsc::Receiver<ControlMsg>,
        auto_restart: bool,
    ) {
        let processes = self.processes.clone();
        let controls = self.controls.clone();
        let rpc = self.rpc.clone();
        let shutting_down = self.shutting_down.clone();
        let events = self.events.clone();
        let configuration = self.configuration.clone();

        tokio::spawn(async move {
            enum Outcome {
                ExitedOnOwn(std::io::Result<std::process::ExitStatus>),
                IntentionalStop,
            }

            let outcome = tokio::select! {
                status = child.wait() => Outcome::ExitedOnOwn(status),
                msg = control_rx.recv() => {
                    match msg {
                        Some(ControlMsg::Stop { shutdown_timeout, ack }) => {
                            if let Some(pid) = child.id() {
                                let _ = send_signal_to_group(pid, Signal::Term);
                            }
                            let waited = tokio::time::timeout(shutdown_timeout, child.wait()).await;
                            if waited.is_err() {
                                tracing::warn!(service = %name, "shutdown timeout elapsed, sending SIGKILL");
                                if let Some(pid) = child.id() {
                                    let _ = send_signal_to_group(pid, Signal::Kill);
                                }
                                let _ = child.kill().await;
                                let _ = child.wait().await;
                            }
                            let _ = ack.send(());
                            Outcome::IntentionalStop
                        }
                        None => Outcome::IntentionalStop,
                    }
                }
            };

            controls.write().await.remove(&name);
            rpc.write().await.remove(&name);

            match outcome {
                Outcome::IntentionalStop => {
                    let mut guard = processes.write().await;
                    if let Some(entry) = guard.get_mut(&name) {
                        entry.pid = None;
                        entry.state = ServiceState::Stopped;
                    }
                }
                Outcome::ExitedOnOwn(status) => {
                    if shutting_down.load(Ordering::SeqCst) {
                        return;
                    }

                    let exit_code = status.as_ref().ok().and_then(|s| s.code()).unwrap_or(-1);
                    let cause = match &status {
                        Ok(s) => format!("process exited with status {s}"),
                        Err(e) => format!("failed to wait on process: {e}"),
                    };
                    tracing::warn!(service = %name, exit_code, "plugin process exited unexpectedly");

                    let restarts = {
                        let mut guard = processes.write().await;
                        let entry = guard
                            .entry(name.clone())
                            .or_insert_with(|| ServiceProcess::new(&name));
                        entry.state = ServiceState::Failed;
                        entry.pid = None;
                        entry.last_error = Some(cause);
                        entry.restarts
                    };
                    let _ = events.send(SupervisorEvent::StateChanged {
                        service: name.clone(),
                        state: ServiceState::Failed,
                    });

                    if !auto_restart || restarts >= MAX_RESTARTS {
                        tracing::warn!(service = %name, restarts, "giving up on restarting plugin process");
                        return;
                    }

                    {
                        let mut guard = processes.write().await;
                        if let Some(entry) = guard.get_mut(&name) {
                            entry.state = ServiceState::Restarting;
                        }
                    }
                    let _ = events.send(SupervisorEvent::StateChanged {
                        service: name.clone(),
                        state: ServiceState::Restarting,
                    });

                    let delay = backoff_delay(restarts);
                    tracing::info!(service = %name, delay_ms = delay.as_millis() as u64, "backing off before restart");
                    tokio::time::sleep(delay).await;

                    if shutting_down.load(Ordering::SeqCst) {
                        return;
                    }

                    {
                        let mut guard = processes.write().await;
                        if let Some(entry) = guard.get_mut(&name) {
                            entry.restarts += 1;
                        }
                    }

                    let supervisor = Supervisor {
                        processes,
                        controls,
                        rpc,
                        configuration,
                        shutting_down,
                        events,
                    };
                    if let Err(e) = supervisor.spawn(&name).await {
                        tracing::error!(service = %name, error = %e, "restart attempt failed");
                    }
                }
            }
        });
    }

    /// Stop `name`: SIGTERM the process group, wait up to `ShutdownTimeout`, then SIGKILL.
    pub async fn stop(&self, name: &str) -> ForgeResult<()> {
        let shutdown_timeout = self
            .configuration
            .get_service_config(name)
            .map(|c| Duration::from_secs(c.shutdown_timeout_secs))
            .unwrap_or_else(|_| Duration::from_secs(5));

        let control_tx = { self.controls.read().await.get(name).cloned() };
        let Some(control_tx) = control_tx else {
            // Not running; normalize to the stopped state.
            self.set_process(name, |p| p.state = ServiceState::Stopped)
                .await;
            self.emit(name, ServiceState::Stopped);
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if control_tx
            .send(ControlMsg::Stop {
                shutdown_timeout,
                ack: ack_tx,
            })
            .await
            .is_err()
        {
            // Supervision task already gone; process must have exited on its own.
            self.set_process(name, |p| p.state = ServiceState::Stopped)
                .await;
            self.emit(name, ServiceState::Stopped);
            return Ok(());
        }

        // Give the supervision task a generous grace window beyond its own
        // internal timeout to actually deliver SIGKILL and reap the child.
        let _ = tokio::time::timeout(shutdown_timeout + Duration::from_secs(5), ack_rx).await;

        self.set_process(name, |p| p.state = ServiceState::Stopped)
            .await;
        self.emit(name, ServiceState::Stopped);
        Ok(())
    }

    /// Stop then re-spawn `name`, carrying the restart counter forward and incrementing it.
    pub async fn restart(&self, name: &str) -> ForgeResult<()> {
        self.set_process(name, |p| p.state = ServiceState::Restarting)
            .await;
        self.emit(name, ServiceState::Restarting);

        let prior_restarts = self
            .processes
            .read()
            .await
            .get(name)
            .map(|p| p.restarts)
            .unwrap_or(0);

        self.stop(name).await?;
        self.spawn(name).await?;

        self.set_process(name, |p| p.restarts = prior_restarts + 1)
            .await;
        Ok(())
    }

    /// Snapshot the current record for `name`, if it has ever been spawned.
    pub async fn status(&self, name: &str) -> Option<ServiceProcess> {
        self.processes.read().await.get(name).cloned()
    }

    /// Snapshot all known records.
    pub async fn list(&self) -> Vec<ServiceProcess> {
        self.processes.read().await.values().cloned().collect()
    }

    /// Stop every supervised process and refuse further spawns. Idempotent.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let names: Vec<String> = self.controls.read().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop(&name).await;
        }
    }

    async fn set_process(&self, name: &str, mutate: impl FnOnce(&mut ServiceProcess)) {
        let mut guard = self.processes.write().await;
        let entry = guard
            .entry(name.to_string())
            .or_insert_with(|| ServiceProcess::new(name));
        mutate(entry);
    }

    fn emit(&self, name: &str, state: ServiceState) {
        let _ = self.events.send(SupervisorEvent::StateChanged {
            service: name.to_string(),
            state,
        });
    }
}

/// Exponential backoff with jitter: `delay = min(30s, 1s * 2^k) * U(0.9, 1.1)`.
fn backoff_delay(k: u32) -> Duration {
    let multiplier = 1u32.checked_shl(k).unwrap_or(u32::MAX).max(1);
    let base = BACKOFF_CAP.min(Duration::from_secs(1).saturating_mul(multiplier));
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(base.as_secs_f64() * jitter)
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal_to_group(pid: u32, signal: Signal) -> ForgeResult<()> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    // Negated pid addresses the whole process group created via process_group(0) at spawn time.
    let group_pid = Pid::from_raw(-(pid as i32));
    match kill(group_pid, sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()), // already gone
        Err(e) => Err(ForgeError::Other(format!(
            "failed to signal process group {pid}: {e}"
        ))),
    }
}

#[cfg(not(unix))]
fn send_signal_to_group(_pid: u32, _signal: Signal) -> ForgeResult<()> {
    // No process-group signalling outside Unix; callers fall back to Child::kill().
    Ok(())
}

/// Owns the child's stdin. Assigns each call a fresh id, records the
/// response channel in `pending`, then writes the request line. Never holds
/// `pending`'s lock across the write/flush await.
fn spawn_rpc_writer(
    name: String,
    mut stdin: tokio::process::ChildStdin,
    mut call_rx: mpsc::Receiver<RpcCall>,
    pending: PendingRpc,
) {
    tokio::spawn(async move {
        let next_id = AtomicU64::new(1);
        while let Some(call) = call_rx.recv().await {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            let mut line = match serde_json::to_string(&serde_json::json!({
                "id": id,
                "method": call.method,
                "params": call.params,
            })) {
                Ok(s) => s,
                Err(e) => {
                    let _ = call.respond_to.send(Err(ForgeError::Serialization(e)));
                    continue;
                }
            };
            line.push('\n');

            pending.lock().unwrap().insert(id, call.respond_to);

            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                if let Some(tx) = pending.lock().unwrap().remove(&id) {
                    let _ = tx.send(Err(ForgeError::Other(format!(
                        "rpc write to '{name}' failed: {e}"
                    ))));
                }
                break;
            }
            if let Err(e) = stdin.flush().await {
                if let Some(tx) = pending.lock().unwrap().remove(&id) {
                    let _ = tx.send(Err(ForgeError::Other(format!(
                        "rpc flush to '{name}' failed: {e}"
                    ))));
                }
                break;
            }
        }
    });
}

/// Owns the child's stdout. Parses each line as a `{id, result}`/`{id,
/// error}` response and resolves the matching entry in `pending`. Any call
/// still pending when stdout closes is failed with a connection-closed error.
fn spawn_rpc_reader(name: String, stdout: tokio::process::ChildStdout, pending: PendingRpc) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let response: RpcWireResponse = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(service = %name, error = %e, "malformed rpc response line");
                            continue;
                        }
                    };
                    let tx = pending.lock().unwrap().remove(&response.id);
                    if let Some(tx) = tx {
                        let result = match (response.result, response.error) {
                            (Some(v), _) => Ok(v),
                            (None, Some(e)) => Err(ForgeError::ProcessError {
                                service: name.clone(),
                                cause: e.message,
                                exit_code: e.code as i32,
                            }),
                            (None, None) => Ok(Value::Null),
                        };
                        let _ = tx.send(result);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(service = %name, error = %e, "rpc stdout read error");
                    break;
                }
            }
        }
        for (_, tx) in pending.lock().unwrap().drain() {
            let _ = tx.send(Err(ForgeError::Other(format!(
                "rpc connection to '{name}' closed"
            ))));
        }
    });
}

fn spawn_log_forwarder(
    service: String,
    source: &'static str,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(service = %service, source, "{line}");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(service = %service, source, error = %e, "log forwarder read error");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, InMemoryConfiguration, ServiceConfig};
    use std::io::Write;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        drop(f);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn configuration_for(
        dir: &tempfile::TempDir,
        name: &str,
        script: &std::path::Path,
    ) -> Arc<InMemoryConfiguration> {
        let cfg = InMemoryConfiguration::new();
        cfg.set_global_config(GlobalConfig {
            services_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let mut svc = ServiceConfig::new(script, dir.path().join(format!("{name}-data")));
        svc.shutdown_timeout_secs = 2;
        cfg.set_service_config(name, svc).unwrap();
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn spawn_and_stop_transitions_to_running_then_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleeper", "sleep 30");
        let configuration = configuration_for(&dir, "sleeper", &script);

        let supervisor = Supervisor::new(configuration);
        supervisor.spawn("sleeper").await.unwrap();

        let status = supervisor.status("sleeper").await.unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert!(status.pid.is_some());

        supervisor.stop("sleeper").await.unwrap();
        let status = supervisor.status("sleeper").await.unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = InMemoryConfiguration::new();
        cfg.set_global_config(GlobalConfig {
            services_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        cfg.set_service_config(
            "ghost",
            ServiceConfig::new("/nonexistent/ghost", dir.path().join("ghost-data")),
        )
        .unwrap();

        let supervisor = Supervisor::new(Arc::new(cfg));
        let result = supervisor.spawn("ghost").await;
        assert!(result.is_err());
        let status = supervisor.status("ghost").await.unwrap();
        assert_eq!(status.state, ServiceState::Failed);
    }

    #[tokio::test]
    async fn exiting_binary_is_restarted_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "flaky", "exit 1");
        let configuration = configuration_for(&dir, "flaky", &script);

        let supervisor = Supervisor::new(configuration);
        let mut events = supervisor.subscribe();
        supervisor.spawn("flaky").await.unwrap();

        // Drain events until we observe at least one Failed transition; bound
        // the wait generously since the first backoff is ~1s.
        let saw_failed = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(SupervisorEvent::StateChanged { state, .. }) = events.recv().await {
                    if state == ServiceState::Failed {
                        return true;
                    }
                }
            }
        })
        .await
        .unwrap_or(false);

        assert!(saw_failed);
    }

    #[test]
    fn backoff_is_capped_and_monotonic_before_cap() {
        let d0 = backoff_delay(0);
        let d3 = backoff_delay(3);
        let d10 = backoff_delay(10);
        assert!(d0.as_secs_f64() <= 1.1 + 0.01);
        assert!(d3.as_secs_f64() <= 8.8 + 0.01);
        assert!(d10.as_secs_f64() <= BACKOFF_CAP.as_secs_f64() * 1.1 + 0.01);
    }
}
