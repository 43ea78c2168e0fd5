//! Stackform Core Library
//!
//! Dependency-ordered lifecycle orchestration for stacks of instances declared
//! in a compose file and run on an instance-management control plane.

pub mod compose;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod graph;
pub mod naming;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod reconcile;
pub mod types;
pub mod validation;

// Re-export commonly used items
pub use compose::LoadOptions;
pub use config::{Remote, RemoteConfig, RemoteProtocol};
pub use context::OrchestratorContext;
pub use control::{Connector, ControlPlane, MemoryConnector, MemoryControlPlane, RestConnector, RestControlPlane};
pub use error::{ResourceKind, Result, StackError, ValidationReport, Violation};
pub use graph::DependencyGraph;
pub use observability::init as init_observability;
pub use orchestrator::{
    DownOptions, ExportOptions, Orchestrator, RemoveOptions, ServiceState, ServiceStatus, SnapshotOptions,
    StopOptions, UpOptions,
};
pub use types::{Bind, PortMapping, Protocol, Secret, Service, SnapshotPolicy, Stack, Volume};
