//! Stack domain types.

use crate::error::{Result, StackError};
use crate::graph::DependencyGraph;
use crate::types::{Bind, PortMapping, Volume};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Project used when the manifest does not name one.
pub const DEFAULT_PROJECT: &str = "default";

/// Profile applied when the manifest declares none.
pub const DEFAULT_PROFILE: &str = "default";

/// Multi-service stack loaded from a manifest.
///
/// Immutable once built: the dependency graph is computed at construction, so a
/// `Stack` value always has resolvable, acyclic dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct Stack {
    /// Stack name, part of every generated resource name
    pub name: String,

    /// Control-plane project every resource lives in
    pub project: String,

    /// Profiles applied to every service, in declaration order
    pub profiles: Vec<String>,

    /// Directory export archives are written to
    pub export_path: PathBuf,

    /// Directory the manifest was loaded from
    pub working_dir: PathBuf,

    /// Top-level secret name -> host file
    pub secret_files: BTreeMap<String, PathBuf>,

    services: BTreeMap<String, Service>,

    #[serde(skip)]
    graph: DependencyGraph,
}

impl Stack {
    /// Build a stack from its services.
    ///
    /// Fails with `UnknownDependency` or `CircularDependency` when the declared
    /// dependencies do not form a DAG over the declared services.
    pub fn new(name: impl Into<String>, services: impl IntoIterator<Item = Service>) -> Result<Self> {
        let services: BTreeMap<String, Service> =
            services.into_iter().map(|s| (s.name.clone(), s)).collect();
        let graph = DependencyGraph::build(&services)?;
        Ok(Self {
            name: name.into(),
            project: DEFAULT_PROJECT.to_string(),
            profiles: Vec::new(),
            export_path: PathBuf::from("."),
            working_dir: PathBuf::from("."),
            secret_files: BTreeMap::new(),
            services,
            graph,
        })
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_profiles(mut self, profiles: impl IntoIterator<Item = String>) -> Self {
        self.profiles.clear();
        for profile in profiles {
            if !self.profiles.contains(&profile) {
                self.profiles.push(profile);
            }
        }
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_export_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_path = dir.into();
        self
    }

    pub fn with_secret_files(mut self, files: BTreeMap<String, PathBuf>) -> Self {
        self.secret_files = files;
        self
    }

    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| StackError::ServiceNotFound { service: name.to_string() })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Dependencies before dependents.
    pub fn bring_up_order(&self) -> Result<Vec<String>> {
        self.graph.order(true)
    }

    /// Dependents before dependencies.
    pub fn teardown_order(&self) -> Result<Vec<String>> {
        self.graph.order(false)
    }

    /// Stack-level profiles, or `default` when none were declared.
    pub fn effective_profiles(&self) -> Vec<String> {
        if self.profiles.is_empty() {
            vec![DEFAULT_PROFILE.to_string()]
        } else {
            self.profiles.clone()
        }
    }
}

/// Service in a stack: one instance-to-be.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Service name (key in the manifest)
    pub name: String,

    /// Image reference, optionally `remote:alias`
    pub image: String,

    /// Instance name override
    #[serde(default)]
    pub container_name: Option<String>,

    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Logical name -> custom volume
    #[serde(default)]
    pub volumes: BTreeMap<String, Volume>,

    /// Logical name -> host bind mount
    #[serde(default)]
    pub bind_mounts: BTreeMap<String, Bind>,

    /// Logical name -> secret reference
    #[serde(default)]
    pub secrets: BTreeMap<String, Secret>,

    #[serde(default)]
    pub snapshot: Option<SnapshotPolicy>,

    #[serde(default)]
    pub additional_profiles: Vec<String>,

    /// Variables; `None` values were declared without a value
    #[serde(default)]
    pub environment: BTreeMap<String, Option<String>>,

    #[serde(default)]
    pub env_files: Vec<PathBuf>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Networks in declaration order
    #[serde(default)]
    pub networks: Vec<String>,

    /// Storage pool override for the root disk
    #[serde(default)]
    pub storage: Option<String>,

    #[serde(default)]
    pub gpu: bool,

    #[serde(default)]
    pub cloud_init_user_data: Option<String>,

    #[serde(default)]
    pub cloud_init_user_data_file: Option<PathBuf>,
}

impl Service {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self { name: name.into(), image: image.into(), ..Default::default() }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.insert(dependency.into());
        self
    }

    pub fn with_volume(mut self, logical: impl Into<String>, volume: Volume) -> Self {
        self.volumes.insert(logical.into(), volume);
        self
    }

    pub fn with_bind(mut self, bind: Bind) -> Self {
        self.bind_mounts.insert(bind.device_name(), bind);
        self
    }

    /// Name of the control-plane instance backing this service.
    pub fn instance_name(&self) -> &str {
        self.container_name.as_deref().unwrap_or(&self.name)
    }

    /// True when the service carries cloud-init data and needs a generated profile.
    pub fn has_cloud_init(&self) -> bool {
        self.cloud_init_user_data.as_deref().is_some_and(|d| !d.is_empty())
            || self.cloud_init_user_data_file.is_some()
    }

    /// Storage pools referenced by the service: the override and every volume pool.
    pub fn pools(&self) -> BTreeSet<&str> {
        let mut pools: BTreeSet<&str> = self.volumes.values().map(|v| v.pool.as_str()).collect();
        if let Some(storage) = self.storage.as_deref() {
            pools.insert(storage);
        }
        pools
    }
}

/// Secret exposed under `/run/secrets` inside the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Top-level secret the value comes from
    pub source: String,

    /// File name under `/run/secrets`
    pub target: String,
}

/// Automatic snapshot policy applied through `snapshots.*` config keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    #[serde(default)]
    pub schedule: Option<String>,

    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub expiry: Option<String>,
}

impl SnapshotPolicy {
    /// Config entries for the non-empty fields.
    pub fn config(&self) -> BTreeMap<String, String> {
        [
            ("snapshots.schedule", &self.schedule),
            ("snapshots.pattern", &self.pattern),
            ("snapshots.expiry", &self.expiry),
        ]
        .into_iter()
        .filter_map(|(key, value)| match value.as_deref() {
            Some(v) if !v.is_empty() => Some((key.to_string(), v.to_string())),
            _ => None,
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name_override() {
        let mut svc = Service::new("web", "images:debian/12");
        assert_eq!(svc.instance_name(), "web");
        svc.container_name = Some("frontend".into());
        assert_eq!(svc.instance_name(), "frontend");
    }

    #[test]
    fn test_stack_rejects_unknown_dependency() {
        let err = Stack::new("s", vec![Service::new("web", "img").depends_on("db")]).unwrap_err();
        assert!(matches!(
            err,
            StackError::UnknownDependency { ref service, ref dependency } if service == "web" && dependency == "db"
        ));
    }

    #[test]
    fn test_effective_profiles_default() {
        let stack = Stack::new("s", vec![Service::new("a", "img")]).unwrap();
        assert_eq!(stack.effective_profiles(), vec!["default"]);
        let stack = stack.with_profiles(vec!["base".into(), "base".into(), "net".into()]);
        assert_eq!(stack.effective_profiles(), vec!["base", "net"]);
    }

    #[test]
    fn test_snapshot_policy_config_skips_empty() {
        let policy = SnapshotPolicy {
            schedule: Some("@daily".into()),
            pattern: Some(String::new()),
            expiry: Some("2w".into()),
        };
        let config = policy.config();
        assert_eq!(config.len(), 2);
        assert_eq!(config["snapshots.schedule"], "@daily");
        assert_eq!(config["snapshots.expiry"], "2w");
    }

    #[test]
    fn test_pools_include_override() {
        let mut svc = Service::new("db", "img").with_volume("data", Volume::new("/data", "fast"));
        svc.storage = Some("ssd".into());
        assert_eq!(svc.pools().into_iter().collect::<Vec<_>>(), vec!["fast", "ssd"]);
    }
}
