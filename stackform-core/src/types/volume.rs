//! Volume domain types.

use crate::naming;
use crate::types::SnapshotPolicy;
use serde::{Deserialize, Serialize};

/// Pool used when neither the volume nor the service names one.
pub const DEFAULT_POOL: &str = "default";

/// Custom storage volume owned by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Mount path in the instance
    pub mountpoint: String,

    /// Storage pool
    pub pool: String,

    #[serde(default)]
    pub snapshot: Option<SnapshotPolicy>,

    #[serde(default)]
    pub read_only: bool,

    /// Enable ID shifting on the volume
    #[serde(default)]
    pub shift: bool,
}

impl Volume {
    pub fn new(mountpoint: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            pool: pool.into(),
            snapshot: None,
            read_only: false,
            shift: false,
        }
    }
}

/// Host directory mounted into an instance as a disk device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    /// Host path
    pub source: String,

    /// Mount path in the instance
    pub target: String,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub shift: bool,
}

impl Bind {
    /// Device type of every bind.
    pub const DEVICE_TYPE: &'static str = "disk";

    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into(), read_only: false, shift: false }
    }

    /// Stable device name, derived from the source path.
    pub fn device_name(&self) -> String {
        naming::bind_device_name(&self.source)
    }
}
