//! `up`, `down`, `start`, `stop`, `restart` and `rm`

use anyhow::Result;
use colored::Colorize;
use stackform_core::{DownOptions, Orchestrator, RemoveOptions, StopOptions, UpOptions};

fn announce(verb: &str, orch: &Orchestrator) {
    let stack = orch.stack();
    let names: Vec<&str> = stack.services().keys().map(String::as_str).collect();
    println!(
        "{} {} {} service(s): {}",
        "→".cyan().bold(),
        verb,
        names.len(),
        names.join(", ").dimmed()
    );
}

pub async fn up(orch: &Orchestrator, wait: bool, skip_checks: bool) -> Result<()> {
    announce("Bringing up", orch);
    orch.up(&UpOptions { wait, skip_checks }).await?;
    println!("{} Stack up: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}

pub async fn down(orch: &Orchestrator, force: bool, volumes: bool, timeout: i64) -> Result<()> {
    announce("Tearing down", orch);
    orch.down(&DownOptions { force, volumes, timeout }).await?;
    println!("{} Stack down: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}

pub async fn start(orch: &Orchestrator, wait: bool) -> Result<()> {
    orch.start(wait).await?;
    println!("{} Started: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}

pub async fn stop(orch: &Orchestrator, stateful: bool, force: bool, timeout: i64) -> Result<()> {
    orch.stop(&StopOptions { stateful, force, timeout }).await?;
    println!("{} Stopped: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}

pub async fn restart(orch: &Orchestrator) -> Result<()> {
    orch.restart().await?;
    println!("{} Restarted: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}

pub async fn rm(orch: &Orchestrator, force: bool, stop: bool, volumes: bool, timeout: i64) -> Result<()> {
    orch.remove(&RemoveOptions { force, stop, volumes, timeout }).await?;
    println!("{} Removed: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}
