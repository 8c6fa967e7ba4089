//! Component G: the plugin registry (§4.G).
//!
//! Discovery walks a directory tree for `plugin.json` manifests; registration
//! maintains a name-keyed map plus an inverted capability index; search
//! matches every supplied criterion; marketplace federation and dependency
//! cycle detection round it out. The `DashMap`-backed map plus explicit
//! visited-set/recursion-stack cycle check are grounded on `registry.rs`'s
//! `PluginRegistry`/`check_dependency_cycle` shape elsewhere in this codebase;
//! directory discovery is grounded on `loader.rs`'s `PluginDiscovery` walk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ForgeError, ForgeResult};
use crate::marketplace::MarketplaceClient;
use crate::model::{PluginInfo, PluginSpec, SearchCriteria};

/// Discovers `plugin.json` manifests under `root`, parsing and validating
/// each as a `PluginSpec` and rebasing relative local source paths onto the
/// manifest's directory. Parse errors on a single file are logged and
/// skipped; they never abort the walk.
pub async fn discover(root: &Path) -> Vec<PluginSpec> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory during discovery");
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) != Some("plugin.json") {
                continue;
            }

            match load_spec(&path).await {
                Ok(spec) => found.push(spec),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid plugin.json");
                }
            }
        }
    }

    found
}

async fn load_spec(path: &Path) -> ForgeResult<PluginSpec> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ForgeError::io(path.to_path_buf(), e))?;
    let mut spec: PluginSpec = serde_json::from_slice(&bytes)?;
    spec.validate()?;
    if let Some(parent) = path.parent() {
        spec.rebase_local_path(parent);
    }
    Ok(spec)
}

/// Name-keyed plugin registry with an inverted capability index,
/// dependency-cycle validation, and optional marketplace federation.
pub struct Registry {
    plugins: DashMap<String, PluginInfo>,
    dependencies: DashMap<String, Vec<String>>,
    capability_index: DashMap<String, HashSet<String>>,
    marketplace: Option<Arc<dyn MarketplaceClient>>,
}

impl Registry {
    /// Construct an empty registry with no marketplace client configured.
    pub fn new() -> Self {
        Self {
            plugins: DashMap::new(),
            dependencies: DashMap::new(),
            capability_index: DashMap::new(),
            marketplace: None,
        }
    }

    /// Construct a registry backed by `marketplace` for fetch/publish.
    pub fn with_marketplace(marketplace: Arc<dyn MarketplaceClient>) -> Self {
        Self {
            plugins: DashMap::new(),
            dependencies: DashMap::new(),
            capability_index: DashMap::new(),
            marketplace: Some(marketplace),
        }
    }

    /// Register `info`, derived from a validated spec. Fails if the name is
    /// already registered, or if registering would introduce a dependency
    /// cycle. `dependencies` lists the names this plugin depends on (from its
    /// originating `PluginSpec`); missing *required* dependencies fail
    /// registration, missing optional ones are tolerated.
    pub fn register(
        &self,
        info: PluginInfo,
        dependencies: &[crate::model::PluginDependency],
    ) -> ForgeResult<()> {
        if self.plugins.contains_key(&info.name) {
            return Err(ForgeError::already_exists(format!("plugin '{}'", info.name)));
        }

        for dep in dependencies {
            if dep.required && !self.plugins.contains_key(&dep.name) {
                return Err(ForgeError::invalid_spec(format!(
                    "plugin '{}' depends on unregistered plugin '{}'",
                    info.name, dep.name
                )));
            }
        }

        self.check_dependency_cycle(&info.name, dependencies)?;

        for capability in &info.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(info.name.clone());
        }

        let dep_names: Vec<String> = dependencies.iter().map(|d| d.name.clone()).collect();
        self.dependencies.insert(info.name.clone(), dep_names);
        self.plugins.insert(info.name.clone(), info);
        Ok(())
    }

    /// Remove `name`'s record and every capability-index entry pointing at it.
    pub fn unregister(&self, name: &str) -> ForgeResult<()> {
        let info = self
            .plugins
            .remove(name)
            .ok_or_else(|| ForgeError::not_found(format!("plugin '{name}'")))?
            .1;
        for capability in &info.capabilities {
            if let Some(mut names) = self.capability_index.get_mut(capability) {
                names.remove(name);
            }
        }
        self.dependencies.remove(name);
        Ok(())
    }

    /// Fetch a single plugin's current record.
    pub fn get(&self, name: &str) -> ForgeResult<PluginInfo> {
        self.plugins
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| ForgeError::not_found(format!("plugin '{name}'")))
    }

    /// Return every `PluginInfo` matching every populated field of `criteria`.
    ///
    /// Version bounds use lexicographic string comparison rather than semver
    /// ordering, a documented limitation preserved intentionally (see
    /// DESIGN.md Open Question 1); the registry still validates that
    /// `version` parses as semver at registration time (via
    /// `PluginSpec::validate`), it only skips semver *ordering* here.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<PluginInfo> {
        let candidate_names: Option<HashSet<String>> = if criteria.capabilities.is_empty() {
            None
        } else {
            let mut iter = criteria.capabilities.iter();
            let first = iter
                .next()
                .and_then(|c| self.capability_index.get(c).map(|e| e.clone()))
                .unwrap_or_default();
            Some(iter.fold(first, |acc, cap| {
                let set = self
                    .capability_index
                    .get(cap)
                    .map(|e| e.clone())
                    .unwrap_or_default();
                acc.intersection(&set).cloned().collect()
            }))
        };

        let scan: Vec<PluginInfo> = match &candidate_names {
            Some(names) => names
                .iter()
                .filter_map(|n| self.plugins.get(n).map(|e| e.clone()))
                .collect(),
            None => self.plugins.iter().map(|e| e.clone()).collect(),
        };

        scan.into_iter().filter(|info| matches(info, criteria)).collect()
    }

    /// Pull a spec from the configured marketplace. Fails "not configured" if none is set.
    pub async fn fetch_from_marketplace(&self, id: &str) -> ForgeResult<PluginSpec> {
        let client = self
            .marketplace
            .as_ref()
            .ok_or_else(|| ForgeError::NotConfigured {
                what: "marketplace client".to_string(),
            })?;
        client.fetch(id).await
    }

    /// Publish `spec` to the configured marketplace after validation. Fails "not configured" if none is set.
    pub async fn publish_to_marketplace(&self, spec: &PluginSpec) -> ForgeResult<()> {
        spec.validate()?;
        let client = self
            .marketplace
            .as_ref()
            .ok_or_else(|| ForgeError::NotConfigured {
                what: "marketplace client".to_string(),
            })?;
        client.publish(spec).await
    }

    fn check_dependency_cycle(
        &self,
        name: &str,
        deps: &[crate::model::PluginDependency],
    ) -> ForgeResult<()> {
        let mut visited = HashSet::new();
        let stack = vec![name.to_string()];

        for dep in deps {
            if dep.name == name {
                return Err(ForgeError::invalid_spec(format!(
                    "plugin '{name}' depends on itself"
                )));
            }
            if let Some(dep_deps) = self.dependencies.get(&dep.name) {
                let mut next_stack = stack.clone();
                next_stack.push(dep.name.clone());
                if !self.check_cycle_recursive(&dep.name, &dep_deps, &mut visited, &next_stack) {
                    return Err(ForgeError::invalid_spec(format!(
                        "registering '{name}' would introduce a dependency cycle through '{}'",
                        dep.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_cycle_recursive(
        &self,
        current: &str,
        deps: &[String],
        visited: &mut HashSet<String>,
        stack: &[String],
    ) -> bool {
        if stack.iter().filter(|s| s.as_str() == current).count() > 1 {
            return false;
        }
        if visited.contains(current) {
            return true;
        }
        visited.insert(current.to_string());

        for dep in deps {
            if let Some(dep_deps) = self.dependencies.get(dep) {
                let mut next_stack = stack.to_vec();
                next_stack.push(dep.clone());
                if !self.check_cycle_recursive(dep, &dep_deps, visited, &next_stack) {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(info: &PluginInfo, criteria: &SearchCriteria) -> bool {
    if let Some(name) = &criteria.name {
        if !info.name.to_lowercase().contains(&name.to_lowercase()) {
            return false;
        }
    }
    if let Some(author) = &criteria.author {
        let matches_author = info
            .metadata
            .get("author")
            .map(|a| a.to_lowercase().contains(&author.to_lowercase()))
            .unwrap_or(false);
        if !matches_author {
            return false;
        }
    }
    if let Some(license) = &criteria.license {
        if info.metadata.get("license") != Some(license) {
            return false;
        }
    }
    if let Some(min_version) = &criteria.min_version {
        if &info.version < min_version {
            return false;
        }
    }
    if let Some(max_version) = &criteria.max_version {
        if &info.version > max_version {
            return false;
        }
    }
    for capability in &criteria.capabilities {
        if !info.capabilities.contains(capability) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Isolation, PluginDependency, PluginSource, PluginStatus, ResourceSpec, SourceKind};
    use std::collections::HashMap;

    fn info(name: &str, version: &str, capabilities: &[&str]) -> PluginInfo {
        let mut metadata = HashMap::new();
        metadata.insert("author".to_string(), "ada".to_string());
        metadata.insert("license".to_string(), "MIT".to_string());
        PluginInfo {
            name: name.to_string(),
            version: version.to_string(),
            metadata,
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            status: PluginStatus::Loaded,
            load_time: chrono::Utc::now(),
            uptime_secs: 0,
        }
    }

    #[test]
    fn register_then_get_round_trips() {
        let registry = Registry::new();
        registry.register(info("echo", "1.0.0", &["storage"]), &[]).unwrap();
        assert_eq!(registry.get("echo").unwrap().version, "1.0.0");
    }

    #[test]
    fn register_duplicate_name_fails() {
        let registry = Registry::new();
        registry.register(info("echo", "1.0.0", &[]), &[]).unwrap();
        let err = registry.register(info("echo", "2.0.0", &[]), &[]).unwrap_err();
        assert!(matches!(err, ForgeError::AlreadyExists { .. }));
    }

    #[test]
    fn unregister_clears_capability_index() {
        let registry = Registry::new();
        registry.register(info("echo", "1.0.0", &["storage"]), &[]).unwrap();
        registry.unregister("echo").unwrap();

        let criteria = SearchCriteria {
            capabilities: vec!["storage".to_string()],
            ..Default::default()
        };
        assert!(registry.search(&criteria).is_empty());
    }

    #[test]
    fn search_matches_every_supplied_criterion() {
        let registry = Registry::new();
        registry.register(info("echo", "1.0.0", &["storage", "net"]), &[]).unwrap();
        registry.register(info("relay", "1.5.0", &["net"]), &[]).unwrap();

        let criteria = SearchCriteria {
            name: Some("ec".to_string()),
            capabilities: vec!["storage".to_string()],
            ..Default::default()
        };
        let results = registry.search(&criteria);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "echo");
    }

    #[test]
    fn search_capability_intersection_requires_all() {
        let registry = Registry::new();
        registry.register(info("echo", "1.0.0", &["storage"]), &[]).unwrap();
        registry.register(info("relay", "1.0.0", &["storage", "net"]), &[]).unwrap();

        let criteria = SearchCriteria {
            capabilities: vec!["storage".to_string(), "net".to_string()],
            ..Default::default()
        };
        let results = registry.search(&criteria);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "relay");
    }

    #[test]
    fn dependency_on_missing_required_plugin_fails() {
        let registry = Registry::new();
        let dep = PluginDependency {
            name: "missing".to_string(),
            version_range: "*".to_string(),
            required: true,
        };
        let err = registry.register(info("echo", "1.0.0", &[]), &[dep]).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidSpec { .. }));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let registry = Registry::new();
        registry
            .register(
                info("a", "1.0.0", &[]),
                &[PluginDependency {
                    name: "b".to_string(),
                    version_range: "*".to_string(),
                    required: false,
                }],
            )
            .unwrap();
        registry
            .register(
                info("b", "1.0.0", &[]),
                &[PluginDependency {
                    name: "a".to_string(),
                    version_range: "*".to_string(),
                    required: true,
                }],
            )
            .unwrap_err();
    }

    #[tokio::test]
    async fn fetch_without_marketplace_is_not_configured() {
        let registry = Registry::new();
        let err = registry.fetch_from_marketplace("echo").await.unwrap_err();
        assert!(matches!(err, ForgeError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn discover_skips_invalid_manifests_and_finds_valid_ones() {
        let dir = tempfile::tempdir().unwrap();
        let good_dir = dir.path().join("echo");
        tokio::fs::create_dir_all(&good_dir).await.unwrap();
        let spec = PluginSpec {
            name: "echo".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            source: PluginSource {
                kind: SourceKind::Local,
                path: "echo".to_string(),
            },
            isolation: Isolation::Process,
            capabilities: vec![],
            permissions: vec![],
            resources: ResourceSpec::default(),
            dependencies: vec![],
            extra: HashMap::new(),
        };
        tokio::fs::write(good_dir.join("plugin.json"), serde_json::to_vec(&spec).unwrap())
            .await
            .unwrap();

        let bad_dir = dir.path().join("broken");
        tokio::fs::create_dir_all(&bad_dir).await.unwrap();
        tokio::fs::write(bad_dir.join("plugin.json"), b"not json")
            .await
            .unwrap();

        let found = discover(dir.path()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "echo");
        assert_eq!(found[0].source.path, good_dir.join("echo").to_string_lossy());
    }
}
