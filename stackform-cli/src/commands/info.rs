//! `info` command

use anyhow::Result;
use colored::Colorize;
use stackform_core::{Orchestrator, ServiceState, ServiceStatus};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "INSTANCE")]
    instance: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "TYPE")]
    instance_type: String,
    #[tabled(rename = "IPV4")]
    ipv4: String,
    #[tabled(rename = "DEVICES")]
    devices: String,
}

impl From<ServiceStatus> for ServiceRow {
    fn from(status: ServiceStatus) -> Self {
        Self {
            service: status.service,
            instance: status.instance,
            status: colorize_state(&status.state),
            instance_type: status.instance_type.unwrap_or_else(|| "-".to_string()),
            ipv4: or_dash(status.ipv4.join(", ")),
            devices: or_dash(status.devices.join(", ")),
        }
    }
}

fn or_dash(value: String) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value
    }
}

fn colorize_state(state: &ServiceState) -> String {
    let label = state.to_string();
    match state {
        ServiceState::Running => label.green().to_string(),
        ServiceState::Stopped => label.red().to_string(),
        ServiceState::Absent => label.dimmed().to_string(),
        ServiceState::Other(_) => label.yellow().to_string(),
    }
}

/// Show every service's instance state
pub async fn info(orch: &Orchestrator) -> Result<()> {
    let rows: Vec<ServiceRow> = orch.info().await?.into_iter().map(ServiceRow::from).collect();

    println!("{} {}", "Stack:".bold(), orch.stack().name);
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);

    Ok(())
}
