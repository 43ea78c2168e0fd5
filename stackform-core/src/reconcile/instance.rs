//! Instance creation and state transitions.

use super::{ensure_exists, image, network, profile, Ensured, Shape};
use crate::compose::parse_env_content;
use crate::context::OrchestratorContext;
use crate::control::{device, Device, InstanceInfo, InstanceSpec, StateChange};
use crate::error::{ResourceKind, Result, StackError};
use crate::types::{Service, Stack};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// Config key recording which stack created an instance.
pub const STACK_MARKER: &str = "user.stackform.stack";

/// Exit code of `cloud-init status` for "done, with recoverable errors".
pub const CLOUD_INIT_RECOVERABLE: i64 = 2;

/// Instance config: environment, labels, snapshot policy and the stack marker.
pub async fn instance_config(stack: &Stack, service: &Service) -> Result<BTreeMap<String, String>> {
    let mut environment = BTreeMap::new();
    for file in &service.env_files {
        let content = tokio::fs::read_to_string(file).await.map_err(|e| StackError::io(file, e))?;
        environment.extend(parse_env_content(&content));
    }
    for (key, value) in &service.environment {
        // a bare key takes its value from the caller's environment
        match value.clone().or_else(|| std::env::var(key).ok()) {
            Some(value) => {
                environment.insert(key.clone(), value);
            }
            None => {
                environment.remove(key);
            }
        }
    }

    let mut config: BTreeMap<String, String> =
        environment.into_iter().map(|(k, v)| (format!("environment.{}", k), v)).collect();
    config.extend(service.labels.iter().map(|(k, v)| (format!("user.{}", k), v.clone())));
    if let Some(policy) = &service.snapshot {
        config.extend(policy.config());
    }
    config.insert(STACK_MARKER.to_string(), stack.name.clone());
    Ok(config)
}

/// Devices created with the instance: NICs, root override, GPU and port proxies.
pub fn instance_devices(service: &Service, nics: BTreeMap<String, Device>) -> BTreeMap<String, Device> {
    let mut devices = nics;
    if let Some(pool) = service.storage.as_deref() {
        devices.insert("root".to_string(), device([("type", "disk"), ("path", "/"), ("pool", pool)]));
    }
    if service.gpu {
        devices.insert(super::device::GPU_DEVICE.to_string(), device([("type", "gpu")]));
    }
    for port in &service.ports {
        let (listen, connect) = (port.listen(), port.connect());
        devices.insert(
            port.device_name(),
            device([("type", "proxy"), ("listen", listen.as_str()), ("connect", connect.as_str())]),
        );
    }
    devices
}

/// Stack profiles, then the service's own, then its cloud-init profile.
pub fn instance_profiles(stack: &Stack, service: &Service, cloud_init: Option<&str>) -> Vec<String> {
    let mut profiles = stack.effective_profiles();
    for name in service.additional_profiles.iter().map(String::as_str).chain(cloud_init) {
        if !profiles.iter().any(|p| p == name) {
            profiles.push(name.to_string());
        }
    }
    profiles
}

/// Accepts instances created by this stack or carrying no marker.
pub fn owned_by(stack: &str) -> impl FnOnce(&InstanceInfo) -> Shape + '_ {
    move |current| match current.config.get(STACK_MARKER) {
        Some(owner) if owner != stack => Shape::Differs(format!("instance belongs to stack '{}'", owner)),
        _ => Shape::Desired,
    }
}

async fn instance_spec(
    ctx: &OrchestratorContext,
    stack: &Stack,
    service: &Service,
    remote: &str,
    name: &str,
) -> Result<InstanceSpec> {
    let cloud_init = profile::ensure_cloud_init_profile(ctx, stack, service).await?;
    let image = image::resolve(ctx, remote, &service.image).await?;
    let client = ctx.connect(remote)?;
    let nics = network::nic_devices(client.as_ref(), ctx.project(), service).await?;

    Ok(InstanceSpec {
        name: name.to_string(),
        description: format!("{}/{}", stack.name, service.name),
        instance_type: image.instance_type,
        source: image.source,
        profiles: instance_profiles(stack, service, cloud_init.as_deref()),
        config: instance_config(stack, service).await?,
        devices: instance_devices(service, nics),
    })
}

/// Create the service's instance unless it already exists.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_instance(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<Ensured> {
    let (remote, name) = ctx.instance_remote(service);
    let client = ctx.connect(&remote)?;
    ensure_exists(
        ResourceKind::Instance,
        &name,
        client.instance(ctx.project(), &name),
        owned_by(&stack.name),
        || async {
            let spec = instance_spec(ctx, stack, service, &remote, &name).await?;
            client.create_instance(ctx.project(), &spec).await
        },
    )
    .await
}

async fn current(ctx: &OrchestratorContext, service: &Service) -> Result<Option<(InstanceInfo, String)>> {
    let (client, name) = ctx.client_for(service)?;
    Ok(client.instance(ctx.project(), &name).await?.map(|info| (info, name)))
}

fn missing(service: &Service) -> StackError {
    StackError::NotFound { kind: ResourceKind::Instance, name: service.instance_name().to_string() }
}

/// Start the instance if it is not running. Returns whether it was started.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn start(ctx: &OrchestratorContext, service: &Service) -> Result<bool> {
    let (info, name) = current(ctx, service).await?.ok_or_else(|| missing(service))?;
    if info.status.is_running() {
        info!("Instance '{}' already running", name);
        return Ok(false);
    }
    let (client, _) = ctx.client_for(service)?;
    client.update_instance_state(ctx.project(), &name, &StateChange::start()).await?;
    info!("Started instance '{}'", name);
    Ok(true)
}

/// Stop the instance if it is running. A missing instance counts as stopped.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn stop(ctx: &OrchestratorContext, service: &Service, change: StateChange) -> Result<bool> {
    let Some((info, name)) = current(ctx, service).await? else {
        info!("Instance '{}' does not exist, nothing to stop", service.instance_name());
        return Ok(false);
    };
    if !info.status.is_running() {
        info!("Instance '{}' already stopped", name);
        return Ok(false);
    }
    let (client, _) = ctx.client_for(service)?;
    client.update_instance_state(ctx.project(), &name, &change).await?;
    info!("Stopped instance '{}'", name);
    Ok(true)
}

/// Restart a running instance, start a stopped one.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn restart(ctx: &OrchestratorContext, service: &Service) -> Result<()> {
    let (info, name) = current(ctx, service).await?.ok_or_else(|| missing(service))?;
    let (client, _) = ctx.client_for(service)?;
    let change = if info.status.is_running() { StateChange::restart() } else { StateChange::start() };
    client.update_instance_state(ctx.project(), &name, &change).await?;
    info!("Restarted instance '{}'", name);
    Ok(())
}

/// Delete the instance. A running instance is stopped first only with `force`.
///
/// Returns whether an instance was deleted.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn delete(ctx: &OrchestratorContext, service: &Service, force: bool, timeout: i64) -> Result<bool> {
    let Some((info, name)) = current(ctx, service).await? else {
        info!("Instance '{}' does not exist, nothing to remove", service.instance_name());
        return Ok(false);
    };
    let (client, _) = ctx.client_for(service)?;
    if info.status.is_running() {
        if !force {
            return Err(StackError::InstanceRunning { instance: name });
        }
        client.update_instance_state(ctx.project(), &name, &StateChange::stop(timeout, true, false)).await?;
        info!("Stopped instance '{}'", name);
    }
    client.delete_instance(ctx.project(), &name).await?;
    info!("Removed instance '{}'", name);
    Ok(true)
}

/// Block until cloud-init inside the instance has finished.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn wait_for_cloud_init(ctx: &OrchestratorContext, service: &Service) -> Result<()> {
    let (client, name) = ctx.client_for(service)?;
    info!("Waiting for cloud-init in '{}'", name);
    let command = ["cloud-init", "status", "--wait"].map(String::from);
    match client.exec(ctx.project(), &name, &command).await? {
        0 => Ok(()),
        CLOUD_INIT_RECOVERABLE => {
            warn!("cloud-init in '{}' finished with recoverable errors", name);
            Ok(())
        }
        exit_code => Err(StackError::CloudInitFailed { instance: name, exit_code }),
    }
}
