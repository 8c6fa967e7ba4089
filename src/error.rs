//! Crate-wide error type.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// The unified error hierarchy for the plugin runtime.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Plugin, version, checkpoint, or service absent.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing subject, e.g. `"plugin 'p'"` or `"checkpoint 'abc'"`.
        what: String,
    },

    /// Duplicate registration.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// Description of the duplicate subject.
        what: String,
    },

    /// A `PluginSpec` failed validation.
    #[error("invalid plugin spec: {reason}")]
    InvalidSpec {
        /// Human-readable reason.
        reason: String,
    },

    /// A `SearchCriteria` value failed validation.
    #[error("invalid search criteria: {reason}")]
    InvalidCriteria {
        /// Human-readable reason.
        reason: String,
    },

    /// Checksum mismatch on state load.
    #[error("state integrity error for plugin '{plugin_id}' version '{version}': checksum mismatch")]
    StateIntegrity {
        /// Plugin identifier.
        plugin_id: String,
        /// State version.
        version: String,
    },

    /// No migrator registered, or the migrator refused the requested range.
    #[error("migration unsupported for plugin '{plugin_id}': {from_version} -> {to_version}")]
    MigrationUnsupported {
        /// Plugin identifier.
        plugin_id: String,
        /// Source version.
        from_version: String,
        /// Target version.
        to_version: String,
    },

    /// Spawn/stop/exit fault, wrapping an OS-level cause.
    #[error("process error for service '{service}': {cause} (exit code {exit_code})")]
    ProcessError {
        /// Plugin/service name.
        service: String,
        /// Human-readable cause.
        cause: String,
        /// Exit code, or -1 if the process never started.
        exit_code: i32,
    },

    /// A graceful-stop, drain, or RPC deadline was exceeded.
    #[error("timeout: {what}")]
    Timeout {
        /// Description of what timed out.
        what: String,
    },

    /// The mesh event bus has been closed.
    #[error("mesh bus closed")]
    BusClosed,

    /// An optional collaborator (e.g. marketplace client) is not configured.
    #[error("not configured: {what}")]
    NotConfigured {
        /// Description of the missing collaborator.
        what: String,
    },

    /// Composite error from the hot-swap coordinator.
    #[error("hot-swap failed for plugin '{plugin_id}' at phase '{phase}': {cause}{rollback}",
        rollback = rollback_suffix(rollback_cause))]
    HotSwapFailed {
        /// Plugin identifier.
        plugin_id: String,
        /// Phase name at which the failure occurred.
        phase: String,
        /// Primary failure cause.
        cause: String,
        /// Secondary failure encountered while rolling back, if any.
        rollback_cause: Option<String>,
    },

    /// A filesystem path could not be read or written.
    #[error("io error at {path:?}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport failure talking to a marketplace.
    #[error("marketplace transport error: {0}")]
    Marketplace(#[from] reqwest::Error),

    /// A malformed URL was supplied for a marketplace or mesh endpoint.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Catch-all for conditions not covered by a dedicated variant.
    #[error("{0}")]
    Other(String),
}

fn rollback_suffix(rollback_cause: &Option<String>) -> String {
    match rollback_cause {
        Some(c) => format!("; rollback also failed: {c}"),
        None => String::new(),
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(source: std::io::Error) -> Self {
        ForgeError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

impl From<tokio::time::error::Elapsed> for ForgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ForgeError::Timeout {
            what: "operation".to_string(),
        }
    }
}

impl ForgeError {
    /// Build an [`ForgeError::Io`] with a path attached.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ForgeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a [`ForgeError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        ForgeError::NotFound { what: what.into() }
    }

    /// Build a [`ForgeError::AlreadyExists`].
    pub fn already_exists(what: impl Into<String>) -> Self {
        ForgeError::AlreadyExists { what: what.into() }
    }

    /// Build a [`ForgeError::InvalidSpec`].
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        ForgeError::InvalidSpec {
            reason: reason.into(),
        }
    }
}
