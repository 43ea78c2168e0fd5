//! Custom storage volumes: creation, attachment and teardown.

use super::device::{disk_at, ensure_device};
use super::{ensure_exists, Shape};
use crate::context::OrchestratorContext;
use crate::control::{device, Device, VolumeSpec};
use crate::error::{ResourceKind, Result};
use crate::naming;
use crate::types::{Service, Stack, Volume};
use tracing::{debug, info, instrument};

pub const CONTENT_TYPE: &str = "filesystem";

/// Creation request for a volume named `name`.
pub fn volume_spec(name: &str, volume: &Volume) -> VolumeSpec {
    let mut config = volume.snapshot.as_ref().map(|s| s.config()).unwrap_or_default();
    if volume.shift {
        config.insert("security.shifted".to_string(), "true".to_string());
    }
    VolumeSpec { name: name.to_string(), content_type: CONTENT_TYPE.to_string(), config }
}

/// Disk device attaching volume `name` at its mountpoint.
pub fn volume_device(name: &str, volume: &Volume) -> Device {
    let mut dev = device([
        ("type", "disk"),
        ("pool", volume.pool.as_str()),
        ("source", name),
        ("path", volume.mountpoint.as_str()),
    ]);
    if volume.read_only {
        dev.insert("readonly".into(), "true".into());
    }
    dev
}

/// Generated names of the service's volumes, with their declarations.
pub fn generated<'a>(stack: &'a Stack, service: &'a Service) -> impl Iterator<Item = (String, &'a Volume)> + 'a {
    service
        .volumes
        .iter()
        .map(move |(logical, volume)| (naming::derive_name(&stack.name, &service.name, logical), volume))
}

#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_volumes(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<()> {
    let (client, _) = ctx.client_for(service)?;
    for (name, volume) in generated(stack, service) {
        let spec = volume_spec(&name, volume);
        ensure_exists(
            ResourceKind::Volume,
            &name,
            client.storage_volume(ctx.project(), &volume.pool, &name),
            |current| {
                Shape::check(current.content_type == CONTENT_TYPE, || {
                    format!("content type is '{}', expected '{}'", current.content_type, CONTENT_TYPE)
                })
            },
            || client.create_storage_volume(ctx.project(), &volume.pool, &spec),
        )
        .await?;
    }
    Ok(())
}

#[instrument(skip_all, fields(service = %service.name))]
pub async fn attach_volumes(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<()> {
    let (client, instance) = ctx.client_for(service)?;
    for (name, volume) in generated(stack, service) {
        ensure_device(
            client.as_ref(),
            ctx.project(),
            &instance,
            &name,
            &volume_device(&name, volume),
            disk_at(&volume.mountpoint),
        )
        .await?;
    }
    Ok(())
}

/// Delete every generated volume of the service that still exists.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn delete_volumes(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<()> {
    let (client, _) = ctx.client_for(service)?;
    for (name, volume) in generated(stack, service) {
        if client.storage_volume(ctx.project(), &volume.pool, &name).await?.is_none() {
            debug!(volume = %name, "Volume already gone");
            continue;
        }
        client.delete_storage_volume(ctx.project(), &volume.pool, &name).await?;
        info!("Deleted volume '{}'", name);
    }
    Ok(())
}

/// Generated volumes of the service that still exist.
pub async fn existing_volumes(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<Vec<String>> {
    let (client, _) = ctx.client_for(service)?;
    let mut found = Vec::new();
    for (name, volume) in generated(stack, service) {
        if client.storage_volume(ctx.project(), &volume.pool, &name).await?.is_some() {
            found.push(name);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotPolicy;

    #[test]
    fn test_volume_spec_config() {
        let mut volume = Volume::new("/data", "fast");
        volume.shift = true;
        volume.snapshot = Some(SnapshotPolicy { schedule: Some("@hourly".into()), ..Default::default() });

        let spec = volume_spec("myapp-db-cache", &volume);
        assert_eq!(spec.content_type, "filesystem");
        assert_eq!(spec.config["security.shifted"], "true");
        assert_eq!(spec.config["snapshots.schedule"], "@hourly");
    }

    #[test]
    fn test_volume_device() {
        let dev = volume_device("myapp-db-cache", &Volume::new("/data", "fast"));
        assert_eq!(dev["pool"], "fast");
        assert_eq!(dev["source"], "myapp-db-cache");
        assert_eq!(dev["path"], "/data");
        assert!(!dev.contains_key("readonly"));
    }

    #[test]
    fn test_generated_names() {
        let service = Service::new("db", "img").with_volume("cache", Volume::new("/data", "fast"));
        let stack = Stack::new("myapp", vec![service.clone()]).unwrap();
        let names: Vec<String> = generated(&stack, &service).map(|(n, _)| n).collect();
        assert_eq!(names, vec!["myapp-db-cache"]);
    }
}
