//! Device reconcilers: bind mounts, secrets and GPU passthrough.

use super::{ensure_exists, Ensured, Shape};
use crate::context::OrchestratorContext;
use crate::control::{device, ControlPlane, Device};
use crate::error::{ResourceKind, Result, StackError};
use crate::naming;
use crate::paths;
use crate::types::{Bind, Service, Stack};
use tracing::{debug, instrument};

/// Mount point of the secrets directory.
pub const SECRETS_PATH: &str = "/run/secrets";

pub const GPU_DEVICE: &str = "gpu";

/// Ensure `instance` carries device `name`.
pub async fn ensure_device(
    client: &dyn ControlPlane,
    project: &str,
    instance: &str,
    name: &str,
    desired: &Device,
    is_desired: impl FnOnce(&Device) -> Shape,
) -> Result<Ensured> {
    let lookup = async {
        let info = client.instance(project, instance).await?.ok_or_else(|| StackError::NotFound {
            kind: ResourceKind::Instance,
            name: instance.to_string(),
        })?;
        Ok(info.devices.get(name).cloned())
    };
    let label = format!("{}/{}", instance, name);
    ensure_exists(ResourceKind::Device, &label, lookup, is_desired, || {
        client.add_device(project, instance, name, desired)
    })
    .await
}

/// Accepts a disk device mounted at `path`.
pub fn disk_at(path: &str) -> impl FnOnce(&Device) -> Shape + '_ {
    move |current| {
        let kind = current.get("type").map(String::as_str).unwrap_or_default();
        let at = current.get("path").map(String::as_str).unwrap_or_default();
        Shape::check(kind == "disk" && at == path, || {
            format!("expected a disk device at '{}', found type '{}' at '{}'", path, kind, at)
        })
    }
}

/// Accepts any device of type `kind`.
pub fn of_type(kind: &str) -> impl FnOnce(&Device) -> Shape + '_ {
    move |current| {
        let found = current.get("type").map(String::as_str).unwrap_or_default();
        Shape::check(found == kind, || format!("expected a '{}' device, found '{}'", kind, found))
    }
}

/// Disk device for a host bind mount.
pub fn bind_device(bind: &Bind) -> Device {
    let mut dev = device([
        ("type", Bind::DEVICE_TYPE),
        ("source", bind.source.as_str()),
        ("path", bind.target.as_str()),
    ]);
    if bind.shift {
        dev.insert("shift".into(), "true".into());
    }
    if bind.read_only {
        dev.insert("readonly".into(), "true".into());
    }
    dev
}

#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_binds(ctx: &OrchestratorContext, service: &Service) -> Result<()> {
    let (client, instance) = ctx.client_for(service)?;
    for (name, bind) in &service.bind_mounts {
        ensure_device(
            client.as_ref(),
            ctx.project(),
            &instance,
            name,
            &bind_device(bind),
            disk_at(&bind.target),
        )
        .await?;
    }
    Ok(())
}

/// Copy the service's secret files next to the manifest and mount them.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_secrets(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<()> {
    if service.secrets.is_empty() {
        return Ok(());
    }

    let dir = paths::secrets_dir(ctx.working_dir(), &service.name);
    tokio::fs::create_dir_all(&dir).await.map_err(|e| StackError::io(&dir, e))?;
    for secret in service.secrets.values() {
        let source = stack.secret_files.get(&secret.source).ok_or_else(|| StackError::InvalidConfig {
            reason: format!("service '{}' uses undefined secret '{}'", service.name, secret.source),
        })?;
        let target = dir.join(&secret.target);
        debug!(source = %source.display(), target = %target.display(), "Copying secret");
        tokio::fs::copy(source, &target).await.map_err(|e| StackError::io(source, e))?;
    }

    let (client, instance) = ctx.client_for(service)?;
    let source = dir.to_string_lossy();
    let desired = device([("type", "disk"), ("source", source.as_ref()), ("path", SECRETS_PATH), ("readonly", "true")]);
    ensure_device(
        client.as_ref(),
        ctx.project(),
        &instance,
        &naming::secrets_device_name(&service.name),
        &desired,
        disk_at(SECRETS_PATH),
    )
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_gpu(ctx: &OrchestratorContext, service: &Service) -> Result<()> {
    if !service.gpu {
        return Ok(());
    }
    let (client, instance) = ctx.client_for(service)?;
    ensure_device(
        client.as_ref(),
        ctx.project(),
        &instance,
        GPU_DEVICE,
        &device([("type", "gpu")]),
        of_type("gpu"),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_device_flags() {
        let mut bind = Bind::new("/srv/app/config", "/etc/app");
        bind.read_only = true;
        let dev = bind_device(&bind);
        assert_eq!(dev["type"], "disk");
        assert_eq!(dev["source"], "/srv/app/config");
        assert_eq!(dev["path"], "/etc/app");
        assert_eq!(dev["readonly"], "true");
        assert!(!dev.contains_key("shift"));
    }

    #[test]
    fn test_disk_at_rejects_other_path() {
        let current = device([("type", "disk"), ("path", "/data")]);
        assert_eq!(disk_at("/data")(&current), Shape::Desired);
        assert!(matches!(disk_at("/srv")(&current), Shape::Differs(_)));
        assert!(matches!(of_type("gpu")(&current), Shape::Differs(_)));
    }
}
