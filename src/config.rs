//! The `Configuration` contract (§6) and an in-memory default implementation.
//!
//! The file-format layer (YAML/JSON on disk) is explicitly external per the spec;
//! this module only defines the trait the rest of the crate consumes and the
//! in-memory implementation used by tests and simple embedders.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};

/// Declarative resource limits attached to a `ServiceConfig`, mirroring the
/// `resources` hints on `PluginSpec` (§3) at the supervision layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes (0 = unlimited).
    pub max_memory_bytes: u64,
    /// Relative CPU shares (0 = unlimited/default).
    pub cpu_shares: u32,
    /// Relative I/O scheduling weight (0 = unlimited/default).
    pub io_weight: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 256 * 1024 * 1024,
            cpu_shares: 1024,
            io_weight: 500,
        }
    }
}

/// Per-service supervision inputs (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Path to the plugin binary. Relative paths are resolved against `services_dir`.
    pub binary_path: PathBuf,
    /// Extra argv entries appended after the standard `--service` flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Additional environment variables merged into the restricted child environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-plugin data directory; created if missing.
    pub data_dir: PathBuf,
    /// Resource limit hints passed down to the supervisor.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Whether the supervisor auto-restarts this service on unexpected exit.
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl ServiceConfig {
    /// Build a minimal config pointing at `binary_path` with a sibling data directory.
    pub fn new(binary_path: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            data_dir: data_dir.into(),
            resources: ResourceLimits::default(),
            auto_restart: true,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Process-wide defaults applied when a `ServiceConfig` does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Root directory under which per-service binaries are located
    /// (`servicesDir/name/name` unless a `ServiceConfig` overrides `binary_path`).
    pub services_dir: PathBuf,
    /// Root directory for per-plugin state artifacts (component C).
    pub state_dir: PathBuf,
    /// Root directory for checkpoint artifacts (component D).
    pub checkpoint_dir: PathBuf,
    /// Default shutdown timeout applied when a `ServiceConfig` doesn't override it.
    pub default_shutdown_timeout_secs: u64,
    /// Maximum consecutive auto-restarts before a service is considered terminally failed.
    pub max_restarts: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::from("/var/lib/forge/services"),
            state_dir: PathBuf::from("/var/lib/forge/state"),
            checkpoint_dir: PathBuf::from("/var/lib/forge/checkpoints"),
            default_shutdown_timeout_secs: 5,
            max_restarts: 10,
        }
    }
}

/// The configuration contract consumed by the rest of the crate. A real
/// deployment supplies its own implementation backed by whatever file format
/// (YAML/JSON/TOML) it prefers; this crate only defines the trait plus
/// `InMemoryConfiguration` for tests and simple embedders.
pub trait Configuration: Send + Sync {
    /// Look up the per-service configuration for `name`.
    fn get_service_config(&self, name: &str) -> ForgeResult<ServiceConfig>;
    /// Replace the per-service configuration for `name`.
    fn set_service_config(&self, name: &str, cfg: ServiceConfig) -> ForgeResult<()>;
    /// Read the process-wide defaults.
    fn get_global_config(&self) -> ForgeResult<GlobalConfig>;
    /// Replace the process-wide defaults.
    fn set_global_config(&self, cfg: GlobalConfig) -> ForgeResult<()>;
}

/// In-memory `Configuration` implementation.
pub struct InMemoryConfiguration {
    services: RwLock<HashMap<String, ServiceConfig>>,
    global: RwLock<GlobalConfig>,
}

impl InMemoryConfiguration {
    /// Construct a configuration store with default global settings and no services.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            global: RwLock::new(GlobalConfig::default()),
        }
    }

    /// Construct with explicit global defaults.
    pub fn with_global(global: GlobalConfig) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            global: RwLock::new(global),
        }
    }
}

impl Default for InMemoryConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration for InMemoryConfiguration {
    fn get_service_config(&self, name: &str) -> ForgeResult<ServiceConfig> {
        self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ForgeError::not_found(format!("service config '{name}'")))
    }

    fn set_service_config(&self, name: &str, cfg: ServiceConfig) -> ForgeResult<()> {
        self.services.write().insert(name.to_string(), cfg);
        Ok(())
    }

    fn get_global_config(&self) -> ForgeResult<GlobalConfig> {
        Ok(self.global.read().clone())
    }

    fn set_global_config(&self, cfg: GlobalConfig) -> ForgeResult<()> {
        *self.global.write() = cfg;
        Ok(())
    }
}
