//! Lifecycle orchestrator.
//!
//! Every command walks the stack's dependency graph one service at a time and
//! runs a fixed pipeline of reconcilers per service. The first error stops the
//! walk; services already handled are left as they are.
//!
//! Bring-up (`up`, `start`, `restart`, `snapshot`, `export`, `info`) visits
//! dependencies before dependents; teardown (`down`, `stop`, `rm`) visits
//! dependents first.

mod options;

pub use options::{DownOptions, ExportOptions, RemoveOptions, SnapshotOptions, StopOptions, UpOptions};

use crate::context::OrchestratorContext;
use crate::control::{BackupSpec, InstanceStatus, SnapshotSpec, StateChange};
use crate::error::{Result, StackError};
use crate::naming;
use crate::reconcile::{device, instance, network, profile, volume};
use crate::types::{Service, Stack};
use crate::validation;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

/// Default lifetime of a snapshot.
pub const SNAPSHOT_EXPIRY_DAYS: i64 = 7;

/// Lifetime of the server-side backup behind an export.
pub const BACKUP_EXPIRY_HOURS: i64 = 24;

/// Runtime state of a service's instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Absent,
    Running,
    Stopped,
    Other(String),
}

impl From<&InstanceStatus> for ServiceState {
    fn from(status: &InstanceStatus) -> Self {
        match status {
            InstanceStatus::Running => Self::Running,
            InstanceStatus::Stopped => Self::Stopped,
            other => Self::Other(other.as_str().to_string()),
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => f.write_str("Absent"),
            Self::Running => f.write_str("Running"),
            Self::Stopped => f.write_str("Stopped"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// One row of `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub instance: String,
    pub state: ServiceState,
    pub instance_type: Option<String>,
    pub ipv4: Vec<String>,
    pub devices: Vec<String>,
}

/// Drives a stack's lifecycle against the control plane.
pub struct Orchestrator {
    stack: Stack,
    ctx: OrchestratorContext,
}

impl Orchestrator {
    pub fn new(stack: Stack, ctx: OrchestratorContext) -> Self {
        Self { stack, ctx }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    /// Services in `order`, checking for cancellation before each one.
    fn walk(&self, order: Vec<String>) -> impl Iterator<Item = Result<&Service>> + '_ {
        order.into_iter().map(move |name| {
            self.ctx.check_cancelled(&name)?;
            self.stack.service(&name)
        })
    }

    /// Create and start every service, dependencies first.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn up(&self, options: &UpOptions) -> Result<()> {
        if options.skip_checks {
            warn!("Skipping pre-flight checks");
        } else {
            validation::check(&self.stack, &self.ctx).await?;
        }

        for service in self.walk(self.stack.bring_up_order()?) {
            self.up_service(service?, options).await?;
        }
        info!("Stack '{}' is up", self.stack.name);
        Ok(())
    }

    #[instrument(skip_all, fields(service = %service.name))]
    async fn up_service(&self, service: &Service, options: &UpOptions) -> Result<()> {
        let (ctx, stack) = (&self.ctx, &self.stack);
        instance::ensure_instance(ctx, stack, service).await?;
        volume::ensure_volumes(ctx, stack, service).await?;
        device::ensure_binds(ctx, service).await?;
        device::ensure_secrets(ctx, stack, service).await?;
        volume::attach_volumes(ctx, stack, service).await?;
        network::ensure_nics(ctx, service).await?;
        device::ensure_gpu(ctx, service).await?;
        instance::start(ctx, service).await?;
        if options.wait && service.has_cloud_init() {
            instance::wait_for_cloud_init(ctx, service).await?;
        }
        Ok(())
    }

    /// Stop and remove every service, dependents first.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn down(&self, options: &DownOptions) -> Result<()> {
        for service in self.walk(self.stack.teardown_order()?) {
            let service = service?;
            instance::stop(&self.ctx, service, StateChange::stop(options.timeout, options.force, false)).await?;
            instance::delete(&self.ctx, service, options.force, options.timeout).await?;
            self.release(service, options.volumes).await?;
        }
        info!("Stack '{}' is down", self.stack.name);
        Ok(())
    }

    /// Volume and profile cleanup after an instance is gone.
    async fn release(&self, service: &Service, delete_volumes: bool) -> Result<()> {
        if delete_volumes {
            volume::delete_volumes(&self.ctx, &self.stack, service).await?;
        } else {
            for name in volume::existing_volumes(&self.ctx, &self.stack, service).await? {
                warn!(service = %service.name, "Volume '{}' left behind, pass --volumes to delete it", name);
            }
        }
        profile::delete_cloud_init_profile(&self.ctx, &self.stack, service).await
    }

    /// Start existing instances, dependencies first.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn start(&self, wait: bool) -> Result<()> {
        for service in self.walk(self.stack.bring_up_order()?) {
            let service = service?;
            instance::start(&self.ctx, service).await?;
            if wait && service.has_cloud_init() {
                instance::wait_for_cloud_init(&self.ctx, service).await?;
            }
        }
        Ok(())
    }

    /// Stop running instances, dependents first.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn stop(&self, options: &StopOptions) -> Result<()> {
        let change = StateChange::stop(options.timeout, options.force, options.stateful);
        for service in self.walk(self.stack.teardown_order()?) {
            instance::stop(&self.ctx, service?, change).await?;
        }
        Ok(())
    }

    /// Restart running instances and start stopped ones, dependencies first.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn restart(&self) -> Result<()> {
        for service in self.walk(self.stack.bring_up_order()?) {
            instance::restart(&self.ctx, service?).await?;
        }
        Ok(())
    }

    /// Remove instances, dependents first. Running instances need `stop` or `force`.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn remove(&self, options: &RemoveOptions) -> Result<()> {
        for service in self.walk(self.stack.teardown_order()?) {
            let service = service?;
            if options.stop {
                instance::stop(&self.ctx, service, StateChange::stop(options.timeout, options.force, false)).await?;
            }
            instance::delete(&self.ctx, service, options.force, options.timeout).await?;
            self.release(service, options.volumes).await?;
        }
        Ok(())
    }

    /// Snapshot every instance, and its volumes when asked.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn snapshot(&self, options: &SnapshotOptions) -> Result<()> {
        let now = Utc::now();
        let expires_at = (!options.noexpiry).then(|| now + Duration::days(SNAPSHOT_EXPIRY_DAYS));

        for service in self.walk(self.stack.bring_up_order()?) {
            let service = service?;
            let (client, name) = self.ctx.client_for(service)?;
            let spec = SnapshotSpec { name: naming::snapshot_name(&name, &now), stateful: options.stateful, expires_at };
            client.create_instance_snapshot(self.ctx.project(), &name, &spec).await?;
            info!("Created snapshot '{}' of instance '{}'", spec.name, name);

            if !options.volumes {
                continue;
            }
            for (volume_name, volume) in volume::generated(&self.stack, service) {
                let spec = SnapshotSpec {
                    name: naming::snapshot_name(&volume_name, &now),
                    stateful: false,
                    expires_at,
                };
                client.create_volume_snapshot(self.ctx.project(), &volume.pool, &volume_name, &spec).await?;
                info!("Created snapshot '{}' of volume '{}'", spec.name, volume_name);
            }
        }
        Ok(())
    }

    /// Export instances and/or their volumes to archives under the export path.
    ///
    /// Returns the archives written, in order.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn export(&self, options: &ExportOptions) -> Result<Vec<PathBuf>> {
        let dir = &self.stack.export_path;
        tokio::fs::create_dir_all(dir).await.map_err(|e| StackError::io(dir, e))?;

        let now = Utc::now();
        let expires_at = now + Duration::hours(BACKUP_EXPIRY_HOURS);
        let mut written = Vec::new();

        for service in self.walk(self.stack.bring_up_order()?) {
            let service = service?;
            let (client, name) = self.ctx.client_for(service)?;
            let project = self.ctx.project();

            if !options.custom_volumes_only {
                let target = dir.join(naming::export_file_name(&name, &now));
                let backup = BackupSpec { name: naming::snapshot_name(&name, &now), expires_at, without_snapshots: true };
                let result = client.export_instance(project, &name, &backup, &target).await;
                written.push(keep_or_discard(result, target).await?);
            }

            if !(options.volumes || options.custom_volumes_only) {
                continue;
            }
            for (volume_name, volume) in volume::generated(&self.stack, service) {
                let target = dir.join(naming::export_file_name(&volume_name, &now));
                let backup = BackupSpec {
                    name: naming::snapshot_name(&volume_name, &now),
                    expires_at,
                    without_snapshots: true,
                };
                let result = client.export_volume(project, &volume.pool, &volume_name, &backup, &target).await;
                written.push(keep_or_discard(result, target).await?);
            }
        }
        Ok(written)
    }

    /// Status of every service, in bring-up order.
    #[instrument(skip_all, fields(stack = %self.stack.name))]
    pub async fn info(&self) -> Result<Vec<ServiceStatus>> {
        let mut rows = Vec::new();
        for name in self.stack.bring_up_order()? {
            let service = self.stack.service(&name)?;
            let (client, instance) = self.ctx.client_for(service)?;
            let row = match client.instance(self.ctx.project(), &instance).await? {
                None => ServiceStatus {
                    service: name,
                    instance,
                    state: ServiceState::Absent,
                    instance_type: None,
                    ipv4: Vec::new(),
                    devices: Vec::new(),
                },
                Some(info) => {
                    let state = client.instance_state(self.ctx.project(), &instance).await?.unwrap_or_default();
                    ServiceStatus {
                        service: name,
                        state: ServiceState::from(&info.status),
                        instance_type: Some(info.instance_type),
                        ipv4: state.ipv4.into_values().flatten().collect(),
                        devices: info.devices.into_keys().collect(),
                        instance,
                    }
                }
            };
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Keep a finished archive, remove a partial one.
async fn keep_or_discard(result: Result<u64>, target: PathBuf) -> Result<PathBuf> {
    match result {
        Ok(bytes) => {
            info!("Exported {} ({} bytes)", target.display(), bytes);
            Ok(target)
        }
        Err(e) => {
            if tokio::fs::remove_file(&target).await.is_ok() {
                warn!("Removed partial export {}", target.display());
            }
            Err(e)
        }
    }
}
