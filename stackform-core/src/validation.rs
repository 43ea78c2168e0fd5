//! Pre-flight checks.
//!
//! Confirms, read-only, that every project, profile, storage pool and network
//! the stack refers to exists before anything is created. All violations are
//! collected and reported together.

use crate::context::OrchestratorContext;
use crate::control::ControlPlane;
use crate::error::{Result, StackError, ValidationReport, Violation};
use crate::types::{Stack, DEFAULT_NETWORK};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Names the stack expects to find on one remote.
#[derive(Debug, Default)]
struct Requirements<'a> {
    profiles: BTreeSet<&'a str>,
    pools: BTreeSet<&'a str>,
    networks: BTreeSet<&'a str>,
}

/// Run the pre-flight check for `stack`.
#[instrument(skip_all, fields(stack = %stack.name, project = %ctx.project()))]
pub async fn check(stack: &Stack, ctx: &OrchestratorContext) -> Result<()> {
    let stack_profiles = stack.effective_profiles();

    // group requirements by the remote that will host each instance
    let mut by_remote: BTreeMap<String, Requirements<'_>> = BTreeMap::new();
    for service in stack.services().values() {
        let (remote, _) = ctx.instance_remote(service);
        let req = by_remote.entry(remote).or_default();
        req.profiles.extend(stack_profiles.iter().map(String::as_str));
        req.profiles.extend(service.additional_profiles.iter().map(String::as_str));
        req.pools.extend(service.pools());
        req.networks.extend(service.networks.iter().map(String::as_str).filter(|n| *n != DEFAULT_NETWORK));
    }

    let mut report = ValidationReport::default();
    let mut last_error = None;
    let mut reachable = 0;
    for (remote, req) in &by_remote {
        let client = match ctx.connect(remote) {
            Ok(client) => client,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Remote unreachable during pre-flight check");
                last_error = Some(e);
                continue;
            }
        };
        reachable += 1;
        check_remote(client, ctx.project(), req, &mut report).await?;
    }

    if reachable == 0 {
        return Err(last_error.unwrap_or_else(|| StackError::Connection {
            remote: ctx.config().default_remote.clone(),
            reason: "no service resolves to a reachable remote".to_string(),
        }));
    }

    report.into_result()?;
    info!("Pre-flight check passed");
    Ok(())
}

async fn check_remote(
    client: Arc<dyn ControlPlane>,
    project: &str,
    req: &Requirements<'_>,
    report: &mut ValidationReport,
) -> Result<()> {
    let projects = client.project_names().await?;
    let project_exists = projects.iter().any(|p| p == project);
    if !project_exists {
        report.push(Violation::MissingProject { project: project.to_string() });
    }

    // profiles and networks live inside the project
    if project_exists {
        let profiles = client.profile_names(project).await?;
        for profile in &req.profiles {
            if !profiles.iter().any(|p| p == profile) {
                report.push(Violation::MissingProfile {
                    profile: profile.to_string(),
                    project: project.to_string(),
                });
            }
        }

        if !req.networks.is_empty() {
            let networks = client.network_names(project).await?;
            for network in &req.networks {
                if !networks.iter().any(|n| n == network) {
                    report.push(Violation::MissingNetwork {
                        network: network.to_string(),
                        project: project.to_string(),
                    });
                }
            }
        }
    } else {
        debug!(project, "Skipping profile and network checks for missing project");
    }

    if !req.pools.is_empty() {
        let pools = client.storage_pool_names().await?;
        for pool in &req.pools {
            if !pools.iter().any(|p| p == pool) {
                report.push(Violation::MissingPool { pool: pool.to_string() });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::control::{MemoryConnector, MemoryControlPlane};
    use crate::types::{Service, Volume};

    fn context(plane: Arc<MemoryControlPlane>, project: &str) -> OrchestratorContext {
        OrchestratorContext::new(RemoteConfig::default(), Arc::new(MemoryConnector::new(plane)), project, "/srv")
    }

    #[tokio::test]
    async fn test_check_passes() {
        let plane = Arc::new(MemoryControlPlane::new().with_pool("fast").with_network("lan", true, "bridge"));
        let mut web = Service::new("web", "images:debian/12").with_volume("data", Volume::new("/data", "fast"));
        web.networks = vec!["default".into(), "lan".into()];
        let stack = Stack::new("app", vec![web]).unwrap();

        check(&stack, &context(plane.clone(), "default")).await.unwrap();
        assert!(plane.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_check_reports_every_violation() {
        let plane = Arc::new(MemoryControlPlane::new());
        let mut web = Service::new("web", "img").with_volume("data", Volume::new("/data", "fast"));
        web.additional_profiles = vec!["gpu".into()];
        web.networks = vec!["lan".into()];
        let stack = Stack::new("app", vec![web]).unwrap();

        let err = check(&stack, &context(plane, "default")).await.unwrap_err();
        let StackError::Validation(report) = err else { panic!("expected validation error") };
        assert_eq!(
            report.violations,
            vec![
                Violation::MissingProfile { profile: "gpu".into(), project: "default".into() },
                Violation::MissingNetwork { network: "lan".into(), project: "default".into() },
                Violation::MissingPool { pool: "fast".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_project_still_checks_pools() {
        let plane = Arc::new(MemoryControlPlane::new());
        let web = Service::new("web", "img").with_volume("data", Volume::new("/data", "fast"));
        let stack = Stack::new("app", vec![web]).unwrap();

        let err = check(&stack, &context(plane, "shop")).await.unwrap_err();
        let StackError::Validation(report) = err else { panic!("expected validation error") };
        assert_eq!(
            report.violations,
            vec![Violation::MissingProject { project: "shop".into() }, Violation::MissingPool { pool: "fast".into() }]
        );
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_connection_error() {
        let plane = Arc::new(MemoryControlPlane::new());
        let connector = MemoryConnector::new(plane).with_unreachable("local");
        let ctx = OrchestratorContext::new(RemoteConfig::default(), Arc::new(connector), "default", "/srv");
        let stack = Stack::new("app", vec![Service::new("web", "img")]).unwrap();

        assert!(matches!(check(&stack, &ctx).await.unwrap_err(), StackError::Connection { .. }));
    }
}
