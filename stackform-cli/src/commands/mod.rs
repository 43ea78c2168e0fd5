//! CLI command implementations

pub mod backup;
pub mod info;
pub mod lifecycle;

use crate::GlobalArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use stackform_core::{compose, LoadOptions, Orchestrator, OrchestratorContext, RemoteConfig, RestConnector};
use std::sync::Arc;
use tokio::sync::watch;

/// Load the stack and wire it to the configured remotes.
pub fn load(global: &GlobalArgs) -> Result<Orchestrator> {
    let options = LoadOptions {
        file: global.file.clone(),
        project_name: global.project_name.clone(),
        project: global.project.clone(),
    };
    let stack = compose::load(&global.cwd, &options).context("Failed to load compose file")?;

    let config = RemoteConfig::load()
        .context("Failed to read remote configuration")?
        .with_project_override(global.project.clone());
    let connector = Arc::new(RestConnector::new(config.clone()));
    let ctx = OrchestratorContext::for_stack(config, connector, &stack).with_cancellation(interrupt());

    Ok(Orchestrator::new(stack, ctx))
}

/// Flip to `true` on the first Ctrl-C so the walk stops before the next service.
fn interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} interrupted, finishing the current service", "⚠".yellow().bold());
            let _ = tx.send(true);
        }
    });
    rx
}
