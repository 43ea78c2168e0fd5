//! Network interface devices.
//!
//! Each non-default network a service joins becomes a NIC named `eth{N}`. A
//! managed network is referenced by name; anything else is treated as a host
//! interface and attached as a bridged (bridge networks) or macvlan NIC.

use super::device::{ensure_device, of_type};
use crate::context::OrchestratorContext;
use crate::control::{device, ControlPlane, Device, NetworkInfo};
use crate::error::{ResourceKind, Result, StackError};
use crate::types::{Service, DEFAULT_NETWORK};
use std::collections::BTreeMap;
use tracing::instrument;

/// NIC device for `network`, attached as `iface`.
pub fn nic_device(iface: &str, network: &NetworkInfo) -> Device {
    if network.managed {
        return device([("type", "nic"), ("name", iface), ("network", network.name.as_str())]);
    }
    let nictype = if network.network_type == "bridge" { "bridged" } else { "macvlan" };
    device([("type", "nic"), ("name", iface), ("nictype", nictype), ("parent", network.name.as_str())])
}

/// NIC devices for every network the service joins, keyed by interface name.
pub async fn nic_devices(
    client: &dyn ControlPlane,
    project: &str,
    service: &Service,
) -> Result<BTreeMap<String, Device>> {
    let mut devices = BTreeMap::new();
    let networks = service.networks.iter().filter(|n| n.as_str() != DEFAULT_NETWORK);
    for (index, name) in networks.enumerate() {
        let network = client
            .network(project, name)
            .await?
            .ok_or_else(|| StackError::NotFound { kind: ResourceKind::Network, name: name.clone() })?;
        let iface = format!("eth{}", index);
        devices.insert(iface.clone(), nic_device(&iface, &network));
    }
    Ok(devices)
}

/// Attach any NIC the instance is missing.
#[instrument(skip_all, fields(service = %service.name))]
pub async fn ensure_nics(ctx: &OrchestratorContext, service: &Service) -> Result<()> {
    let (client, instance) = ctx.client_for(service)?;
    for (iface, nic) in nic_devices(client.as_ref(), ctx.project(), service).await? {
        ensure_device(client.as_ref(), ctx.project(), &instance, &iface, &nic, of_type("nic")).await?;
    }
    Ok(())
}
