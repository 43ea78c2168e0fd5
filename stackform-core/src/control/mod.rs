//! Control-plane seam.
//!
//! The orchestrator only ever talks to the instance-management API through the
//! [`ControlPlane`] trait. Every mutating verb returns once the remote
//! asynchronous operation has completed. Lookups model absence as `Ok(None)`;
//! mutations on missing resources fail with [`StackError::NotFound`].
//!
//! [`StackError::NotFound`]: crate::error::StackError::NotFound

pub mod memory;
pub mod rest;

use crate::config::RemoteProtocol;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use memory::{MemoryConnector, MemoryControlPlane};
pub use rest::{RestConnector, RestControlPlane};

/// Device definition: `type` plus type-specific keys.
pub type Device = BTreeMap<String, String>;

/// Build a device map from key/value pairs.
pub fn device<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Device {
    entries.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Instance runtime status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Frozen,
    Error,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            "Frozen" => Self::Frozen,
            "Error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Frozen => "Frozen",
            Self::Error => "Error",
            Self::Other(s) => s,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub name: String,
    pub status: InstanceStatus,
    /// `container` or `virtual-machine`
    pub instance_type: String,
    pub profiles: Vec<String>,
    pub config: BTreeMap<String, String>,
    /// Devices declared on the instance itself (not inherited from profiles)
    pub devices: BTreeMap<String, Device>,
}

/// Runtime state of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceState {
    /// Interface name -> IPv4 addresses
    pub ipv4: BTreeMap<String, Vec<String>>,
}

/// Where a new instance gets its root filesystem from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Image server address; `None` for the instance's own remote
    pub server: Option<String>,
    pub protocol: RemoteProtocol,
    pub alias: Option<String>,
    pub fingerprint: Option<String>,
}

/// Request to create an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub description: String,
    /// `container` or `virtual-machine`
    pub instance_type: String,
    pub source: ImageSource,
    pub profiles: Vec<String>,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, Device>,
}

/// State transition verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
    Restart,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Request to change an instance's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub action: StateAction,
    /// Seconds to wait for a clean shutdown; `-1` waits forever
    pub timeout: i64,
    pub force: bool,
    pub stateful: bool,
}

impl StateChange {
    pub fn start() -> Self {
        Self { action: StateAction::Start, timeout: -1, force: false, stateful: false }
    }

    pub fn restart() -> Self {
        Self { action: StateAction::Restart, timeout: -1, force: false, stateful: false }
    }

    pub fn stop(timeout: i64, force: bool, stateful: bool) -> Self {
        Self { action: StateAction::Stop, timeout, force, stateful }
    }
}

/// Network as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: String,
    pub managed: bool,
    /// `bridge`, `macvlan`, `physical`, ...
    pub network_type: String,
}

/// Custom storage volume as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub pool: String,
    /// `filesystem` or `block`
    pub content_type: String,
    pub config: BTreeMap<String, String>,
}

/// Request to create a custom storage volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub content_type: String,
    pub config: BTreeMap<String, String>,
}

/// Profile as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub name: String,
    pub config: BTreeMap<String, String>,
    /// URLs of the instances using the profile
    pub used_by: Vec<String>,
}

/// Request to create a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
}

/// Request to create a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub name: String,
    pub stateful: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request to create a server-side backup for export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSpec {
    pub name: String,
    pub expires_at: DateTime<Utc>,
    /// Leave the resource's snapshots out of the backup
    pub without_snapshots: bool,
}

/// Image as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub fingerprint: String,
    /// `container` or `virtual-machine`
    pub image_type: String,
}

/// Remote instance-management API.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // Projects
    async fn project_names(&self) -> Result<Vec<String>>;

    // Profiles
    async fn profile_names(&self, project: &str) -> Result<Vec<String>>;
    async fn profile(&self, project: &str, name: &str) -> Result<Option<ProfileInfo>>;
    async fn create_profile(&self, project: &str, spec: &ProfileSpec) -> Result<()>;
    async fn delete_profile(&self, project: &str, name: &str) -> Result<()>;

    // Storage pools
    async fn storage_pool_names(&self) -> Result<Vec<String>>;

    // Networks
    async fn network_names(&self, project: &str) -> Result<Vec<String>>;
    async fn network(&self, project: &str, name: &str) -> Result<Option<NetworkInfo>>;

    // Images
    /// Fingerprint an alias points to.
    async fn image_alias(&self, project: &str, alias: &str) -> Result<Option<String>>;
    async fn image(&self, project: &str, fingerprint: &str) -> Result<Option<ImageInfo>>;

    // Instances
    async fn instance(&self, project: &str, name: &str) -> Result<Option<InstanceInfo>>;
    async fn instance_state(&self, project: &str, name: &str) -> Result<Option<InstanceState>>;
    async fn create_instance(&self, project: &str, spec: &InstanceSpec) -> Result<()>;
    async fn update_instance_state(&self, project: &str, name: &str, change: &StateChange) -> Result<()>;
    async fn delete_instance(&self, project: &str, name: &str) -> Result<()>;

    /// Add a device to an instance. Fails with `AlreadyExists` if the name is taken.
    async fn add_device(&self, project: &str, instance: &str, name: &str, device: &Device) -> Result<()>;

    /// Run a command in an instance and return its exit code.
    async fn exec(&self, project: &str, instance: &str, command: &[String]) -> Result<i64>;

    // Storage volumes
    async fn storage_volume(&self, project: &str, pool: &str, name: &str) -> Result<Option<VolumeInfo>>;
    async fn create_storage_volume(&self, project: &str, pool: &str, spec: &VolumeSpec) -> Result<()>;
    async fn delete_storage_volume(&self, project: &str, pool: &str, name: &str) -> Result<()>;

    // Snapshots
    async fn create_instance_snapshot(&self, project: &str, instance: &str, spec: &SnapshotSpec) -> Result<()>;
    async fn create_volume_snapshot(
        &self,
        project: &str,
        pool: &str,
        volume: &str,
        spec: &SnapshotSpec,
    ) -> Result<()>;

    // Backups
    /// Back up an instance and download the archive to `target`.
    ///
    /// The server-side backup is deleted afterwards whether or not the download
    /// succeeded. Returns the number of bytes written.
    async fn export_instance(
        &self,
        project: &str,
        instance: &str,
        backup: &BackupSpec,
        target: &Path,
    ) -> Result<u64>;

    /// Back up a custom volume and download the archive to `target`.
    async fn export_volume(
        &self,
        project: &str,
        pool: &str,
        volume: &str,
        backup: &BackupSpec,
        target: &Path,
    ) -> Result<u64>;
}

/// Opens control-plane connections by remote name.
pub trait Connector: Send + Sync {
    fn connect(&self, remote: &str) -> Result<Arc<dyn ControlPlane>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status_round_trip() {
        for raw in ["Running", "Stopped", "Frozen", "Error", "Starting"] {
            assert_eq!(InstanceStatus::parse(raw).as_str(), raw);
        }
        assert!(InstanceStatus::parse("Running").is_running());
        assert_eq!(InstanceStatus::parse("Starting"), InstanceStatus::Other("Starting".into()));
    }

    #[test]
    fn test_device_builder() {
        let dev = device([("type", "disk"), ("path", "/data")]);
        assert_eq!(dev["type"], "disk");
        assert_eq!(dev.len(), 2);
    }
}
