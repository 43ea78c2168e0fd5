//! Error types for stackform.
//!
//! All errors use `thiserror` and every variant names the resource it is about,
//! so a failure can always be traced to a service, volume, profile or remote.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stackform operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Kinds of control-plane resources the orchestrator touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Project,
    Instance,
    Volume,
    Device,
    Profile,
    Network,
    StoragePool,
    Snapshot,
    Backup,
    Image,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::Device => "device",
            Self::Profile => "profile",
            Self::Network => "network",
            Self::StoragePool => "storage pool",
            Self::Snapshot => "snapshot",
            Self::Backup => "backup",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for stackform.
#[derive(Error, Debug)]
pub enum StackError {
    // Load-time errors
    #[error("Circular dependency detected between services: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error(
        "Missing dependency: service '{service}' depends on '{dependency}' which does not exist"
    )]
    UnknownDependency { service: String, dependency: String },

    #[error("Invalid compose file at {path:?}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("No compose file found in {dir:?}")]
    ManifestNotFound { dir: PathBuf },

    // Pre-flight errors
    #[error("Cannot connect to remote '{remote}': {reason}")]
    Connection { remote: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationReport),

    // Reconciliation errors
    #[error("{kind} '{name}' already exists but does not match the declared shape: {reason}")]
    Conflict { kind: ResourceKind, name: String, reason: String },

    // Remote errors
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("Failed to {operation} '{resource}': {reason}")]
    Remote { operation: String, resource: String, reason: String },

    // Precondition errors
    #[error("Instance '{instance}' is currently running, stop it first or pass --force")]
    InstanceRunning { instance: String },

    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("cloud-init failed in instance '{instance}' (exit code {exit_code})")]
    CloudInitFailed { instance: String, exit_code: i64 },

    // Local errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Cancelled before processing service '{next_service}'")]
    Cancelled { next_service: String },
}

impl StackError {
    /// Build a remote failure for `operation` on `resource`.
    pub fn remote(
        operation: impl Into<String>,
        resource: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Remote {
            operation: operation.into(),
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// True when the control plane reported the resource as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the control plane refused a create because the resource exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// One failed pre-flight check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("project '{project}' does not exist")]
    MissingProject { project: String },

    #[error("profile '{profile}' does not exist in project '{project}'")]
    MissingProfile { profile: String, project: String },

    #[error("storage pool '{pool}' does not exist")]
    MissingPool { pool: String },

    #[error("network '{network}' does not exist in project '{project}'")]
    MissingNetwork { network: String, project: String },
}

/// Every violation found by the pre-flight check, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn push(&mut self, violation: Violation) {
        if !self.violations.contains(&violation) {
            self.violations.push(violation);
        }
    }

    /// Ok when nothing was recorded, otherwise the report as an error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(StackError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pre-flight check failed:")?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_report_lists_every_name() {
        let mut report = ValidationReport::default();
        report.push(Violation::MissingPool { pool: "fast".into() });
        report.push(Violation::MissingProfile { profile: "gpu".into(), project: "default".into() });
        report.push(Violation::MissingPool { pool: "fast".into() });

        assert_eq!(report.violations.len(), 2);
        let message = StackError::from(report).to_string();
        assert!(message.contains("'fast'"));
        assert!(message.contains("'gpu'"));
    }

    #[test]
    fn test_empty_report_is_ok() {
        assert!(ValidationReport::default().into_result().is_ok());
    }

    #[test]
    fn test_cycle_message_names_services() {
        let err = StackError::CircularDependency { cycle: vec!["a".into(), "b".into(), "a".into()] };
        assert_eq!(err.to_string(), "Circular dependency detected between services: a -> b -> a");
    }

    #[test]
    fn test_classification() {
        let missing = StackError::NotFound { kind: ResourceKind::Volume, name: "v".into() };
        assert!(missing.is_not_found());
        assert!(!missing.is_already_exists());
        let exists = StackError::AlreadyExists { kind: ResourceKind::Profile, name: "p".into() };
        assert!(exists.is_already_exists());
    }
}
