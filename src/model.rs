//! Core data model: `PluginSpec`, `PluginInfo`, `ServiceProcess`, `StateVersion`,
//! `Checkpoint`, `HotSwapStatus`, and the value types used at their call sites.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ForgeError, ForgeResult};

/// Where a plugin's artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A path on the local filesystem.
    Local,
    /// A URL fetched at load time.
    Remote,
    /// Resolved through the plugin marketplace.
    Marketplace,
}

/// Declared isolation strategy for a plugin. Strong sandboxing (namespaces, seccomp)
/// is a non-goal of this crate; this enum only records what was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// No isolation beyond being a separate process.
    None,
    /// Logical grouping hint only; still a separate OS process in this implementation.
    Thread,
    /// A dedicated OS process (the default and the only one this crate enforces).
    Process,
    /// Intended to run inside a container; enforcement is an external collaborator's job.
    Container,
    /// Intended to run inside a VM; enforcement is an external collaborator's job.
    Vm,
}

/// Source location for a plugin's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSource {
    /// Where the artifact comes from.
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Local path or remote URL, depending on `kind`.
    pub path: String,
}

/// Declarative resource hints for a plugin. The supervisor passes these down as
/// environment hints at spawn time; this crate does not itself enforce cgroup-level
/// limits (see DESIGN.md "Dropped teacher functionality").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Requested CPU share, as a percentage of one core.
    pub cpu_percent: f64,
    /// Requested memory ceiling, in MiB.
    pub memory_mib: u64,
    /// Requested relative I/O scheduling weight.
    pub io_weight: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu_percent: 100.0,
            memory_mib: 256,
            io_weight: 500,
        }
    }
}

/// A dependency on another plugin, by name and an (opaque, not yet
/// semver-constrained) version range string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDependency {
    /// Name of the depended-on plugin.
    pub name: String,
    /// Version range expression, e.g. `">=1.0.0, <2.0.0"`.
    pub version_range: String,
    /// Whether the dependency must be present for this plugin to load.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Declarative description of a plugin, as parsed from a `plugin.json` manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Unique plugin identifier.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Author name or handle.
    #[serde(default)]
    pub author: String,
    /// SPDX license identifier or free-form string.
    #[serde(default)]
    pub license: String,
    /// Where to obtain the plugin's binary artifact.
    pub source: PluginSource,
    /// Declared isolation strategy.
    #[serde(default = "default_isolation")]
    pub isolation: Isolation,
    /// Capability tags this plugin advertises, used for registry search.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form permission strings requested by the plugin.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Declarative resource hints.
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Other plugins this plugin depends on.
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    /// Fields present in the manifest but not recognized by this struct.
    /// Preserved verbatim and re-emitted on serialize so a load-then-publish
    /// round trip through the marketplace doesn't silently drop them (§6).
    #[serde(flatten, default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_isolation() -> Isolation {
    Isolation::Process
}

impl PluginSpec {
    /// Validate the invariants from the data model: `name`, `version`, and
    /// `source.path` must be non-empty, and enum fields must already have
    /// parsed to valid members (guaranteed by serde for well-formed JSON;
    /// this also re-checks that the version string parses as semver).
    pub fn validate(&self) -> ForgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(ForgeError::invalid_spec("name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(ForgeError::invalid_spec("version must not be empty"));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            ForgeError::invalid_spec(format!("version '{}' is not valid semver: {e}", self.version))
        })?;
        if self.source.path.trim().is_empty() {
            return Err(ForgeError::invalid_spec("source.path must not be empty"));
        }
        Ok(())
    }

    /// Resolve a relative local source path against the directory the spec file
    /// (`plugin.json`) was loaded from. Remote/marketplace sources are untouched.
    pub fn rebase_local_path(&mut self, spec_dir: &std::path::Path) {
        if self.source.kind != SourceKind::Local {
            return;
        }
        let p = std::path::Path::new(&self.source.path);
        if p.is_relative() {
            self.source.path = spec_dir.join(p).to_string_lossy().into_owned();
        }
    }
}

/// Lifecycle status of a registered plugin, as surfaced by the registry and the
/// control API. Distinct from `ServiceState`, which is the supervisor's narrower
/// process-level view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Registered but not yet started.
    Loaded,
    /// Spawn has been requested.
    Starting,
    /// Running and healthy.
    Running,
    /// Stop has been requested.
    Stopping,
    /// Stopped cleanly.
    Stopped,
    /// Exited unexpectedly or exhausted restarts.
    Failed,
    /// In the middle of a hot-swap.
    Swapping,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginStatus::Loaded => "loaded",
            PluginStatus::Starting => "starting",
            PluginStatus::Running => "running",
            PluginStatus::Stopping => "stopping",
            PluginStatus::Stopped => "stopped",
            PluginStatus::Failed => "failed",
            PluginStatus::Swapping => "swapping",
        };
        write!(f, "{s}")
    }
}

/// Runtime snapshot of a registered plugin, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name (registry key).
    pub name: String,
    /// Currently registered version.
    pub version: String,
    /// Free-form metadata copied from the spec (description, author, license).
    pub metadata: HashMap<String, String>,
    /// Capability tags.
    pub capabilities: Vec<String>,
    /// Current lifecycle status.
    pub status: PluginStatus,
    /// When the plugin was registered/loaded.
    pub load_time: DateTime<Utc>,
    /// Wall-clock duration the plugin has been in a running state, as of the
    /// last status refresh.
    pub uptime_secs: u64,
}

impl PluginInfo {
    /// Construct a fresh `PluginInfo` in `Loaded` status from a validated spec.
    pub fn from_spec(spec: &PluginSpec) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("description".to_string(), spec.description.clone());
        metadata.insert("author".to_string(), spec.author.clone());
        metadata.insert("license".to_string(), spec.license.clone());
        Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
            metadata,
            capabilities: spec.capabilities.clone(),
            status: PluginStatus::Loaded,
            load_time: Utc::now(),
            uptime_secs: 0,
        }
    }
}

/// Supervisor-level process state, distinct from `PluginStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No process running; initial and fully-terminal (until an explicit Spawn).
    Stopped,
    /// Process has been spawned, supervision has not yet confirmed it is up.
    Starting,
    /// Process is up and under supervision.
    Running,
    /// Process exited unexpectedly and will not be retried further.
    Failed,
    /// Process exited and a restart has been scheduled.
    Restarting,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Failed => "failed",
            ServiceState::Restarting => "restarting",
        };
        write!(f, "{s}")
    }
}

/// Metadata for a persisted state blob. One record per (pluginID, version) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateVersion {
    /// Plugin identifier.
    pub plugin_id: String,
    /// Version tag (may be a semver string or the `"current"` convention tag).
    pub version: String,
    /// When the blob was written.
    pub timestamp: DateTime<Utc>,
    /// Byte length of the stored blob.
    pub size: u64,
    /// Lowercase hex-encoded SHA-256 of the stored bytes.
    pub checksum: String,
}

/// An immutable snapshot of a plugin's state, used as a rollback target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id.
    pub id: Uuid,
    /// Plugin the checkpoint was taken of.
    pub plugin_id: String,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
    /// Captured state bytes.
    pub state: Vec<u8>,
    /// Free-form metadata; always includes a `"version"` entry with the source version tag.
    pub metadata: HashMap<String, String>,
}

/// One record per in-flight or recently finished hot-swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotSwapStatus {
    /// Plugin being swapped.
    pub plugin_id: String,
    /// Version being replaced.
    pub old_version: String,
    /// Version being swapped in.
    pub new_version: String,
    /// Human-readable phase name; see `hotswap::Phase`.
    pub status: String,
    /// When the swap started.
    pub start_time: DateTime<Utc>,
    /// When the swap finished, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Terminal error message, if the swap failed.
    pub error: Option<String>,
    /// Checkpoint id taken at the start of the swap, if any was created yet.
    pub checkpoint_id: Option<Uuid>,
}

impl HotSwapStatus {
    /// True once the swap has reached a terminal phase (`completed` or `failed`).
    pub fn is_terminal(&self) -> bool {
        self.status == "completed" || self.status == "failed"
    }
}

/// Search filter for `Registry::search`. Every populated field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Case-insensitive substring match against `PluginInfo::name`.
    pub name: Option<String>,
    /// Case-insensitive substring match against the `author` metadata entry.
    pub author: Option<String>,
    /// Exact match against the `license` metadata entry.
    pub license: Option<String>,
    /// Lexicographic lower bound on `version` (see DESIGN.md Open Question 1).
    pub min_version: Option<String>,
    /// Lexicographic upper bound on `version`.
    pub max_version: Option<String>,
    /// Every listed capability must appear in the plugin's capability set.
    pub capabilities: Vec<String>,
}

/// A generic request dispatched to a plugin's `handle` RPC method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Opaque, plugin-defined operation name.
    pub operation: String,
    /// Opaque, plugin-defined payload.
    pub payload: serde_json::Value,
}

/// The response to a `PluginRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Whether the plugin considers the operation to have succeeded.
    pub success: bool,
    /// Opaque, plugin-defined result payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Human-readable error message, set when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

/// An event published on the mesh event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshEvent {
    /// Hierarchical dotted event-type name, e.g. `"node.peer.connected"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Name of the plugin (or `"control"`) that published the event.
    pub source: String,
    /// Publication timestamp.
    pub timestamp: DateTime<Utc>,
    /// Opaque structured payload; the bus performs no schema validation.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl MeshEvent {
    /// Construct an event with the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> PluginSpec {
        PluginSpec {
            name: "echo".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            source: PluginSource {
                kind: SourceKind::Local,
                path: "echo/echo".to_string(),
            },
            isolation: Isolation::Process,
            capabilities: vec!["storage".to_string()],
            permissions: vec![],
            resources: ResourceSpec::default(),
            dependencies: vec![],
            extra: HashMap::new(),
        }
    }

    #[test]
    fn validate_accepts_well_formed_spec() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_name() {
        let mut spec = sample_spec();
        spec.name = String::new();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_semver_version() {
        let mut spec = sample_spec();
        spec.version = "latest".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rebase_local_path_joins_relative_paths() {
        let mut spec = sample_spec();
        spec.rebase_local_path(std::path::Path::new("/plugins/echo"));
        assert_eq!(spec.source.path, "/plugins/echo/echo/echo");
    }

    #[test]
    fn rebase_local_path_leaves_absolute_paths() {
        let mut spec = sample_spec();
        spec.source.path = "/abs/echo".to_string();
        spec.rebase_local_path(std::path::Path::new("/plugins/echo"));
        assert_eq!(spec.source.path, "/abs/echo");
    }

    #[test]
    fn rebase_local_path_ignores_remote_sources() {
        let mut spec = sample_spec();
        spec.source.kind = SourceKind::Remote;
        spec.source.path = "https://example.com/echo.tar.gz".to_string();
        spec.rebase_local_path(std::path::Path::new("/plugins/echo"));
        assert_eq!(spec.source.path, "https://example.com/echo.tar.gz");
    }

    #[test]
    fn unknown_manifest_fields_survive_a_deserialize_serialize_round_trip() {
        let json = serde_json::json!({
            "name": "echo",
            "version": "1.0.0",
            "source": {"type": "local", "path": "echo/echo"},
            "vendorExtension": {"tier": "gold"},
        });
        let spec: PluginSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.extra.get("vendorExtension").unwrap()["tier"], "gold");

        let republished = serde_json::to_value(&spec).unwrap();
        assert_eq!(republished["vendorExtension"]["tier"], "gold");
    }

    #[test]
    fn plugin_info_from_spec_copies_capabilities() {
        let info = PluginInfo::from_spec(&sample_spec());
        assert_eq!(info.status, PluginStatus::Loaded);
        assert_eq!(info.capabilities, vec!["storage".to_string()]);
    }
}
