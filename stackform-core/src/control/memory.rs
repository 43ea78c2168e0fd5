//! In-process control plane.
//!
//! Holds projects, pools, networks, profiles, images, instances and volumes in
//! memory and enforces the same preconditions as the remote API (a running
//! instance cannot be deleted, a volume in use cannot be deleted, names are
//! unique). Every call is recorded in a journal, and failures can be injected
//! per operation and target.

use super::*;
use crate::error::{ResourceKind, StackError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
}

impl Call {
    /// True for calls that change remote state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self.op,
            "create_profile"
                | "delete_profile"
                | "create_instance"
                | "update_instance_state"
                | "delete_instance"
                | "add_device"
                | "create_storage_volume"
                | "delete_storage_volume"
                | "create_instance_snapshot"
                | "create_volume_snapshot"
                | "export_instance"
                | "export_volume"
        )
    }
}

#[derive(Debug, Default)]
struct State {
    projects: BTreeSet<String>,
    pools: BTreeSet<String>,
    networks: BTreeMap<String, NetworkInfo>,
    /// (project, name)
    profiles: BTreeMap<(String, String), ProfileSpec>,
    aliases: BTreeMap<String, String>,
    images: BTreeMap<String, ImageInfo>,
    /// (project, name)
    instances: BTreeMap<(String, String), InstanceInfo>,
    /// (project, pool, name)
    volumes: BTreeMap<(String, String, String), VolumeInfo>,
    instance_snapshots: Vec<(String, SnapshotSpec)>,
    volume_snapshots: Vec<(String, String, SnapshotSpec)>,
    exit_codes: BTreeMap<String, i64>,
    failures: BTreeSet<(String, String)>,
    calls: Vec<Call>,
}

impl State {
    fn record(&mut self, op: &'static str, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        debug!(op, target = %target, "memory control plane call");
        let failing = self.failures.contains(&(op.to_string(), target.clone()));
        self.calls.push(Call { op, target: target.clone() });
        if failing {
            return Err(StackError::remote(op, target, "injected failure"));
        }
        Ok(())
    }

    fn instance_mut(&mut self, project: &str, name: &str) -> Result<&mut InstanceInfo> {
        self.instances
            .get_mut(&(project.to_string(), name.to_string()))
            .ok_or_else(|| StackError::NotFound { kind: ResourceKind::Instance, name: name.to_string() })
    }

    fn used_by(&self, project: &str, profile: &str) -> Vec<String> {
        self.instances
            .iter()
            .filter(|((p, _), inst)| p == project && inst.profiles.iter().any(|n| n == profile))
            .map(|((_, name), _)| format!("/1.0/instances/{}", name))
            .collect()
    }

    fn volume_in_use(&self, project: &str, pool: &str, volume: &str) -> bool {
        self.instances.iter().any(|((p, _), inst)| {
            p == project
                && inst.devices.values().any(|d| {
                    d.get("type").map(String::as_str) == Some("disk")
                        && d.get("pool").map(String::as_str) == Some(pool)
                        && d.get("source").map(String::as_str) == Some(volume)
                })
        })
    }
}

/// In-memory [`ControlPlane`].
#[derive(Debug)]
pub struct MemoryControlPlane {
    state: Mutex<State>,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    /// A control plane with the `default` project, pool and profile.
    pub fn new() -> Self {
        let mut state = State::default();
        state.projects.insert("default".to_string());
        state.pools.insert("default".to_string());
        state.profiles.insert(
            ("default".to_string(), "default".to_string()),
            ProfileSpec { name: "default".to_string(), description: String::new(), config: BTreeMap::new() },
        );
        Self { state: Mutex::new(state) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_project(self, name: &str) -> Self {
        self.lock().projects.insert(name.to_string());
        self
    }

    pub fn with_pool(self, name: &str) -> Self {
        self.lock().pools.insert(name.to_string());
        self
    }

    pub fn with_profile(self, project: &str, name: &str) -> Self {
        self.lock().profiles.insert(
            (project.to_string(), name.to_string()),
            ProfileSpec { name: name.to_string(), description: String::new(), config: BTreeMap::new() },
        );
        self
    }

    pub fn with_network(self, name: &str, managed: bool, network_type: &str) -> Self {
        self.lock().networks.insert(
            name.to_string(),
            NetworkInfo { name: name.to_string(), managed, network_type: network_type.to_string() },
        );
        self
    }

    pub fn with_image(self, alias: &str, fingerprint: &str, image_type: &str) -> Self {
        let mut state = self.lock();
        state.aliases.insert(alias.to_string(), fingerprint.to_string());
        state.images.insert(
            fingerprint.to_string(),
            ImageInfo { fingerprint: fingerprint.to_string(), image_type: image_type.to_string() },
        );
        drop(state);
        self
    }

    /// Exit code `exec` returns for `instance` (default 0).
    pub fn set_exit_code(&self, instance: &str, code: i64) {
        self.lock().exit_codes.insert(instance.to_string(), code);
    }

    /// Make every `op` call on `target` fail with a remote error.
    pub fn fail_on(&self, op: &str, target: &str) {
        self.lock().failures.insert((op.to_string(), target.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls that changed remote state, in order.
    pub fn mutations(&self) -> Vec<Call> {
        self.lock().calls.iter().filter(|c| c.is_mutation()).cloned().collect()
    }

    /// Targets of every call to `op`, in order.
    pub fn targets(&self, op: &str) -> Vec<String> {
        self.lock().calls.iter().filter(|c| c.op == op).map(|c| c.target.clone()).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn instance_info(&self, project: &str, name: &str) -> Option<InstanceInfo> {
        self.lock().instances.get(&(project.to_string(), name.to_string())).cloned()
    }

    pub fn instance_names(&self, project: &str) -> Vec<String> {
        self.lock()
            .instances
            .keys()
            .filter(|(p, _)| p == project)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn volume_info(&self, project: &str, pool: &str, name: &str) -> Option<VolumeInfo> {
        self.lock()
            .volumes
            .get(&(project.to_string(), pool.to_string(), name.to_string()))
            .cloned()
    }

    pub fn volume_names(&self, project: &str) -> Vec<String> {
        self.lock()
            .volumes
            .keys()
            .filter(|(p, _, _)| p == project)
            .map(|(_, _, n)| n.clone())
            .collect()
    }

    pub fn profile_spec(&self, project: &str, name: &str) -> Option<ProfileSpec> {
        self.lock().profiles.get(&(project.to_string(), name.to_string())).cloned()
    }

    pub fn instance_snapshots(&self) -> Vec<(String, SnapshotSpec)> {
        self.lock().instance_snapshots.clone()
    }

    pub fn volume_snapshots(&self) -> Vec<(String, String, SnapshotSpec)> {
        self.lock().volume_snapshots.clone()
    }

    /// Insert an instance directly, bypassing the journal.
    pub fn insert_instance(&self, project: &str, info: InstanceInfo) {
        self.lock().instances.insert((project.to_string(), info.name.clone()), info);
    }

    /// Insert a volume directly, bypassing the journal.
    pub fn insert_volume(&self, project: &str, info: VolumeInfo) {
        self.lock()
            .volumes
            .insert((project.to_string(), info.pool.clone(), info.name.clone()), info);
    }

    fn write_archive(target: &Path, content: String) -> Result<u64> {
        std::fs::write(target, content.as_bytes()).map_err(|e| StackError::io(target, e))?;
        Ok(content.len() as u64)
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn project_names(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.record("project_names", "")?;
        Ok(state.projects.iter().cloned().collect())
    }

    async fn profile_names(&self, project: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.record("profile_names", project)?;
        Ok(state.profiles.keys().filter(|(p, _)| p == project).map(|(_, n)| n.clone()).collect())
    }

    async fn profile(&self, project: &str, name: &str) -> Result<Option<ProfileInfo>> {
        let mut state = self.lock();
        state.record("profile", name)?;
        let used_by = state.used_by(project, name);
        Ok(state.profiles.get(&(project.to_string(), name.to_string())).map(|spec| ProfileInfo {
            name: spec.name.clone(),
            config: spec.config.clone(),
            used_by,
        }))
    }

    async fn create_profile(&self, project: &str, spec: &ProfileSpec) -> Result<()> {
        let mut state = self.lock();
        state.record("create_profile", &spec.name)?;
        let key = (project.to_string(), spec.name.clone());
        if state.profiles.contains_key(&key) {
            return Err(StackError::AlreadyExists { kind: ResourceKind::Profile, name: spec.name.clone() });
        }
        state.profiles.insert(key, spec.clone());
        Ok(())
    }

    async fn delete_profile(&self, project: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_profile", name)?;
        if !state.used_by(project, name).is_empty() {
            return Err(StackError::remote("delete profile", name, "Profile is currently in use"));
        }
        state
            .profiles
            .remove(&(project.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StackError::NotFound { kind: ResourceKind::Profile, name: name.to_string() })
    }

    async fn storage_pool_names(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.record("storage_pool_names", "")?;
        Ok(state.pools.iter().cloned().collect())
    }

    async fn network_names(&self, project: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.record("network_names", project)?;
        Ok(state.networks.keys().cloned().collect())
    }

    async fn network(&self, _project: &str, name: &str) -> Result<Option<NetworkInfo>> {
        let mut state = self.lock();
        state.record("network", name)?;
        Ok(state.networks.get(name).cloned())
    }

    async fn image_alias(&self, _project: &str, alias: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        state.record("image_alias", alias)?;
        Ok(state.aliases.get(alias).cloned())
    }

    async fn image(&self, _project: &str, fingerprint: &str) -> Result<Option<ImageInfo>> {
        let mut state = self.lock();
        state.record("image", fingerprint)?;
        Ok(state.images.get(fingerprint).cloned())
    }

    async fn instance(&self, project: &str, name: &str) -> Result<Option<InstanceInfo>> {
        let mut state = self.lock();
        state.record("instance", name)?;
        Ok(state.instances.get(&(project.to_string(), name.to_string())).cloned())
    }

    async fn instance_state(&self, project: &str, name: &str) -> Result<Option<InstanceState>> {
        let mut state = self.lock();
        state.record("instance_state", name)?;
        Ok(state.instances.get(&(project.to_string(), name.to_string())).map(|inst| {
            let mut ipv4 = BTreeMap::new();
            if inst.status.is_running() {
                ipv4.insert("eth0".to_string(), vec!["10.0.0.2".to_string()]);
            }
            InstanceState { ipv4 }
        }))
    }

    async fn create_instance(&self, project: &str, spec: &InstanceSpec) -> Result<()> {
        let mut state = self.lock();
        state.record("create_instance", &spec.name)?;
        let key = (project.to_string(), spec.name.clone());
        if state.instances.contains_key(&key) {
            return Err(StackError::AlreadyExists { kind: ResourceKind::Instance, name: spec.name.clone() });
        }
        for profile in &spec.profiles {
            if !state.profiles.contains_key(&(project.to_string(), profile.clone())) {
                return Err(StackError::NotFound { kind: ResourceKind::Profile, name: profile.clone() });
            }
        }
        state.instances.insert(
            key,
            InstanceInfo {
                name: spec.name.clone(),
                status: InstanceStatus::Stopped,
                instance_type: spec.instance_type.clone(),
                profiles: spec.profiles.clone(),
                config: spec.config.clone(),
                devices: spec.devices.clone(),
            },
        );
        Ok(())
    }

    async fn update_instance_state(&self, project: &str, name: &str, change: &StateChange) -> Result<()> {
        let mut state = self.lock();
        state.record("update_instance_state", format!("{}:{}", name, change.action.as_str()))?;
        let inst = state.instance_mut(project, name)?;
        let running = inst.status.is_running();
        match change.action {
            StateAction::Start if running => {
                Err(StackError::remote("start", name, "The instance is already running"))
            }
            StateAction::Stop | StateAction::Restart if !running => {
                Err(StackError::remote(change.action.as_str(), name, "The instance is already stopped"))
            }
            StateAction::Start | StateAction::Restart => {
                inst.status = InstanceStatus::Running;
                Ok(())
            }
            StateAction::Stop => {
                inst.status = InstanceStatus::Stopped;
                Ok(())
            }
        }
    }

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_instance", name)?;
        if state.instance_mut(project, name)?.status.is_running() {
            return Err(StackError::remote("delete", name, "Instance is running"));
        }
        state.instances.remove(&(project.to_string(), name.to_string()));
        Ok(())
    }

    async fn add_device(&self, project: &str, instance: &str, name: &str, device: &Device) -> Result<()> {
        let mut state = self.lock();
        state.record("add_device", format!("{}/{}", instance, name))?;
        let inst = state.instance_mut(project, instance)?;
        if inst.devices.contains_key(name) {
            return Err(StackError::AlreadyExists {
                kind: ResourceKind::Device,
                name: format!("{}/{}", instance, name),
            });
        }
        inst.devices.insert(name.to_string(), device.clone());
        Ok(())
    }

    async fn exec(&self, project: &str, instance: &str, command: &[String]) -> Result<i64> {
        let mut state = self.lock();
        state.record("exec", format!("{}:{}", instance, command.join(" ")))?;
        if !state.instance_mut(project, instance)?.status.is_running() {
            return Err(StackError::remote("exec in", instance, "Instance is not running"));
        }
        Ok(state.exit_codes.get(instance).copied().unwrap_or(0))
    }

    async fn storage_volume(&self, project: &str, pool: &str, name: &str) -> Result<Option<VolumeInfo>> {
        let mut state = self.lock();
        state.record("storage_volume", name)?;
        Ok(state.volumes.get(&(project.to_string(), pool.to_string(), name.to_string())).cloned())
    }

    async fn create_storage_volume(&self, project: &str, pool: &str, spec: &VolumeSpec) -> Result<()> {
        let mut state = self.lock();
        state.record("create_storage_volume", &spec.name)?;
        if !state.pools.contains(pool) {
            return Err(StackError::NotFound { kind: ResourceKind::StoragePool, name: pool.to_string() });
        }
        let key = (project.to_string(), pool.to_string(), spec.name.clone());
        if state.volumes.contains_key(&key) {
            return Err(StackError::AlreadyExists { kind: ResourceKind::Volume, name: spec.name.clone() });
        }
        state.volumes.insert(
            key,
            VolumeInfo {
                name: spec.name.clone(),
                pool: pool.to_string(),
                content_type: spec.content_type.clone(),
                config: spec.config.clone(),
            },
        );
        Ok(())
    }

    async fn delete_storage_volume(&self, project: &str, pool: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_storage_volume", name)?;
        if state.volume_in_use(project, pool, name) {
            return Err(StackError::remote("delete volume", name, "Storage volume is still in use"));
        }
        state
            .volumes
            .remove(&(project.to_string(), pool.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StackError::NotFound { kind: ResourceKind::Volume, name: name.to_string() })
    }

    async fn create_instance_snapshot(&self, project: &str, instance: &str, spec: &SnapshotSpec) -> Result<()> {
        let mut state = self.lock();
        state.record("create_instance_snapshot", format!("{}/{}", instance, spec.name))?;
        state.instance_mut(project, instance)?;
        state.instance_snapshots.push((instance.to_string(), spec.clone()));
        Ok(())
    }

    async fn create_volume_snapshot(
        &self,
        project: &str,
        pool: &str,
        volume: &str,
        spec: &SnapshotSpec,
    ) -> Result<()> {
        let mut state = self.lock();
        state.record("create_volume_snapshot", format!("{}/{}", volume, spec.name))?;
        if !state.volumes.contains_key(&(project.to_string(), pool.to_string(), volume.to_string())) {
            return Err(StackError::NotFound { kind: ResourceKind::Volume, name: volume.to_string() });
        }
        state.volume_snapshots.push((pool.to_string(), volume.to_string(), spec.clone()));
        Ok(())
    }

    async fn export_instance(
        &self,
        project: &str,
        instance: &str,
        backup: &BackupSpec,
        target: &Path,
    ) -> Result<u64> {
        {
            let mut state = self.lock();
            state.record("export_instance", instance)?;
            state.instance_mut(project, instance)?;
        }
        Self::write_archive(
            target,
            format!("instance={} backup={} without_snapshots={}\n", instance, backup.name, backup.without_snapshots),
        )
    }

    async fn export_volume(
        &self,
        project: &str,
        pool: &str,
        volume: &str,
        backup: &BackupSpec,
        target: &Path,
    ) -> Result<u64> {
        {
            let mut state = self.lock();
            state.record("export_volume", volume)?;
            if !state.volumes.contains_key(&(project.to_string(), pool.to_string(), volume.to_string())) {
                return Err(StackError::NotFound { kind: ResourceKind::Volume, name: volume.to_string() });
            }
        }
        Self::write_archive(
            target,
            format!("volume={}/{} backup={} without_snapshots={}\n", pool, volume, backup.name, backup.without_snapshots),
        )
    }
}

/// [`Connector`] handing out one shared [`MemoryControlPlane`].
#[derive(Debug)]
pub struct MemoryConnector {
    plane: Arc<MemoryControlPlane>,
    unreachable: BTreeSet<String>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(plane: Arc<MemoryControlPlane>) -> Self {
        Self { plane, unreachable: BTreeSet::new(), connects: AtomicUsize::new(0) }
    }

    /// Make connecting to `remote` fail.
    pub fn with_unreachable(mut self, remote: &str) -> Self {
        self.unreachable.insert(remote.to_string());
        self
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, remote: &str) -> Result<Arc<dyn ControlPlane>> {
        if self.unreachable.contains(remote) {
            return Err(StackError::Connection {
                remote: remote.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.plane.clone())
    }
}
