//! `snapshot` and `export`

use anyhow::Result;
use colored::Colorize;
use stackform_core::{ExportOptions, Orchestrator, SnapshotOptions};

pub async fn snapshot(orch: &Orchestrator, noexpiry: bool, stateful: bool, volumes: bool) -> Result<()> {
    orch.snapshot(&SnapshotOptions { noexpiry, stateful, volumes }).await?;
    println!("{} Snapshots taken: {}", "✓".green().bold(), orch.stack().name.bold());
    Ok(())
}

pub async fn export(orch: &Orchestrator, volumes: bool, custom_volumes_only: bool) -> Result<()> {
    let archives = orch.export(&ExportOptions { volumes, custom_volumes_only }).await?;

    println!("{} Exported {} archive(s)", "✓".green().bold(), archives.len());
    for path in archives {
        println!("  {} {}", "•".dimmed(), path.display());
    }
    Ok(())
}
