//! Per-command options.

/// Shutdown timeout meaning "wait forever".
pub const NO_TIMEOUT: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpOptions {
    /// Wait for cloud-init to finish in services that declare user-data
    pub wait: bool,

    pub skip_checks: bool,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self { wait: true, skip_checks: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownOptions {
    pub force: bool,

    /// Also delete the services' generated volumes
    pub volumes: bool,

    /// Shutdown timeout in seconds
    pub timeout: i64,
}

impl Default for DownOptions {
    fn default() -> Self {
        Self { force: false, volumes: false, timeout: NO_TIMEOUT }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    pub stateful: bool,
    pub force: bool,
    pub timeout: i64,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self { stateful: false, force: false, timeout: NO_TIMEOUT }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Stop and remove running instances
    pub force: bool,

    /// Stop running instances before removing them
    pub stop: bool,

    pub volumes: bool,
    pub timeout: i64,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self { force: false, stop: false, volumes: false, timeout: NO_TIMEOUT }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Keep snapshots until deleted by hand
    pub noexpiry: bool,

    pub stateful: bool,

    /// Snapshot custom volumes as well
    pub volumes: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Export custom volumes next to each instance
    pub volumes: bool,

    /// Export custom volumes only
    pub custom_volumes_only: bool,
}
