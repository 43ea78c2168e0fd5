//! Network domain types.

use serde::{Deserialize, Serialize};

/// Network every instance reaches through its profiles; never validated or attached.
pub const DEFAULT_NETWORK: &str = "default";

/// Published port, forwarded by a proxy device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to listen on (`0.0.0.0` when unset)
    #[serde(default)]
    pub host_ip: Option<String>,

    /// Host port or range, as written in the manifest
    pub published: String,

    /// Port inside the instance
    pub target: u16,

    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn listen_ip(&self) -> &str {
        self.host_ip.as_deref().filter(|ip| !ip.is_empty()).unwrap_or("0.0.0.0")
    }

    /// Proxy device name.
    pub fn device_name(&self) -> String {
        format!("port-{}-{}", self.listen_ip(), self.published)
    }

    /// Proxy `listen` address, `proto:ip:port`.
    pub fn listen(&self) -> String {
        format!("{}:{}:{}", self.protocol, self.listen_ip(), self.published)
    }

    /// Proxy `connect` address inside the instance.
    pub fn connect(&self) -> String {
        format!("{}:127.0.0.1:{}", self.protocol, self.target)
    }
}

/// Network protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("Unknown protocol: {}", s)),
        }
    }
}
