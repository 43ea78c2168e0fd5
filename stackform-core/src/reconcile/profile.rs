//! Generated cloud-init profiles.
//!
//! A service with inline or file-based user-data gets its own profile carrying
//! that data. The profile is created before the instance and deleted on
//! teardown once no instance uses it any more.

use super::{ensure_exists, Ensured, Shape};
use crate::context::OrchestratorContext;
use crate::control::ProfileSpec;
use crate::error::{ResourceKind, Result, StackError};
use crate::naming;
use crate::types::{Service, Stack};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Profile config key holding the user-data.
pub const USER_DATA_KEY: &str = "user.user-data";

/// User-data declared by the service. A user-data file overrides inline data.
pub async fn user_data(service: &Service) -> Result<Option<String>> {
    if let Some(path) = &service.cloud_init_user_data_file {
        let data = tokio::fs::read_to_string(path).await.map_err(|e| StackError::io(path, e))?;
        return Ok(Some(data));
    }
    Ok(service.cloud_init_user_data.clone().filter(|d| !d.is_empty()))
}

pub fn profile_name(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> String {
    naming::cloud_init_profile_name(ctx.project(), &stack.name, &service.name)
}

/// Create the service's cloud-init profile if it declares user-data.
///
/// Returns the profile name when the service has one.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_cloud_init_profile(
    ctx: &OrchestratorContext,
    stack: &Stack,
    service: &Service,
) -> Result<Option<String>> {
    let Some(data) = user_data(service).await? else {
        return Ok(None);
    };

    let (client, _) = ctx.client_for(service)?;
    let name = profile_name(ctx, stack, service);
    let spec = ProfileSpec {
        name: name.clone(),
        description: format!("cloud-init for {}/{}", stack.name, service.name),
        config: BTreeMap::from([(USER_DATA_KEY.to_string(), data.clone())]),
    };

    ensure_exists(
        ResourceKind::Profile,
        &name,
        client.profile(ctx.project(), &name),
        |current| {
            Shape::check(current.config.get(USER_DATA_KEY) == Some(&data), || {
                "user-data differs from the declared cloud-init data".to_string()
            })
        },
        || client.create_profile(ctx.project(), &spec),
    )
    .await
    .map(|_: Ensured| Some(name))
}

/// Delete the service's cloud-init profile unless an instance still uses it.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn delete_cloud_init_profile(ctx: &OrchestratorContext, stack: &Stack, service: &Service) -> Result<()> {
    if !service.has_cloud_init() {
        return Ok(());
    }

    let (client, _) = ctx.client_for(service)?;
    let name = profile_name(ctx, stack, service);
    let Some(profile) = client.profile(ctx.project(), &name).await? else {
        debug!(profile = %name, "Profile already gone");
        return Ok(());
    };
    if !profile.used_by.is_empty() {
        info!("Keeping profile '{}', still used by {} instance(s)", name, profile.used_by.len());
        return Ok(());
    }

    client.delete_profile(ctx.project(), &name).await?;
    info!("Deleted profile '{}'", name);
    Ok(())
}
