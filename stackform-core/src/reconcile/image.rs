//! Image reference resolution.
//!
//! `remote:alias` references are resolved against the named remote. Image
//! servers (simplestreams, OCI) are passed through by alias; instance servers
//! are asked for the alias target so the instance type follows the image.
//! When a reference without a usable prefix fails on the instance's own
//! remote, its first path segment is tried as a remote name.

use crate::config::RemoteProtocol;
use crate::context::OrchestratorContext;
use crate::control::ImageSource;
use crate::error::{ResourceKind, Result, StackError};
use crate::types::DEFAULT_PROJECT;
use tracing::{debug, instrument};

pub const DEFAULT_INSTANCE_TYPE: &str = "container";

/// A resolved image: where to fetch it and what kind of instance it boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub source: ImageSource,
    pub instance_type: String,
}

#[instrument(skip(ctx))]
pub async fn resolve(ctx: &OrchestratorContext, instance_remote: &str, reference: &str) -> Result<ResolvedImage> {
    let (image_remote, name) = ctx.config().parse_remote(reference);
    let name = if name.is_empty() { "default".to_string() } else { name };

    let first = lookup(ctx, instance_remote, &image_remote, &name).await;
    if first.is_ok() || image_remote != instance_remote {
        return first;
    }

    // `remote/alias` written without the colon
    if let Some((prefix, rest)) = name.split_once('/') {
        if ctx.config().remotes.contains_key(prefix) {
            let rest = if rest.is_empty() { "default" } else { rest };
            debug!(remote = prefix, alias = rest, "Retrying image lookup on prefixed remote");
            return lookup(ctx, instance_remote, prefix, rest).await;
        }
    }
    first
}

async fn lookup(
    ctx: &OrchestratorContext,
    instance_remote: &str,
    image_remote: &str,
    name: &str,
) -> Result<ResolvedImage> {
    let remote = ctx.config().remote(image_remote)?;
    let server = (image_remote != instance_remote).then(|| remote.addr.clone());

    if remote.protocol != RemoteProtocol::Incus {
        return Ok(ResolvedImage {
            source: ImageSource { server, protocol: remote.protocol, alias: Some(name.to_string()), fingerprint: None },
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
        });
    }

    let client = ctx.connect(image_remote)?;
    let project = if image_remote == instance_remote { ctx.project() } else { DEFAULT_PROJECT };
    let fingerprint = client.image_alias(project, name).await?.unwrap_or_else(|| name.to_string());
    let image = client
        .image(project, &fingerprint)
        .await?
        .ok_or_else(|| StackError::NotFound { kind: ResourceKind::Image, name: name.to_string() })?;

    let instance_type =
        if image.image_type.is_empty() { DEFAULT_INSTANCE_TYPE.to_string() } else { image.image_type };
    Ok(ResolvedImage {
        source: ImageSource {
            server,
            protocol: RemoteProtocol::Incus,
            alias: None,
            fingerprint: Some(image.fingerprint),
        },
        instance_type,
    })
}
