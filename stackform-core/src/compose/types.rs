//! Compose file format types.
//!
//! Covers the subset of the Compose specification that maps onto instances.
//! Keys without a counterpart are ignored; `x-` keys are kept for extension parsing.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Root structure of a compose file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Compose file format version (obsolete, accepted for compatibility)
    #[serde(default)]
    pub version: String,

    /// Project name
    #[serde(default)]
    pub name: Option<String>,

    /// Services to be created
    pub services: BTreeMap<String, ComposeService>,

    /// Named volumes
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeDefinition>>,

    /// Networks
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkDefinition>>,

    /// Secrets, backed by local files
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretDefinition>,

    /// Remaining keys, including `x-*` extensions
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A service in a compose file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    /// Image to use
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub container_name: Option<String>,

    /// Port mappings (e.g., ["8080:80", "127.0.0.1:443:443/tcp"])
    #[serde(default)]
    pub ports: Vec<PortEntry>,

    /// Environment variables
    #[serde(default)]
    pub environment: Environment,

    /// Files of `KEY=value` lines merged into the environment
    #[serde(default)]
    pub env_file: Option<StringOrList>,

    /// Volume mounts (e.g., ["./data:/data", "db:/var/lib/db:ro"])
    #[serde(default)]
    pub volumes: Vec<ServiceVolume>,

    /// Networks to connect to
    #[serde(default)]
    pub networks: ServiceNetworks,

    /// Services this service depends on
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Metadata labels
    #[serde(default)]
    pub labels: Labels,

    /// Secrets granted to the service
    #[serde(default)]
    pub secrets: Vec<ServiceSecret>,

    /// Remaining keys, including `x-*` extensions
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A single string or a list of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(list) => list.clone(),
        }
    }
}

/// Environment variables can be specified as a map or list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// Environment as key-value map; `KEY:` with no value is allowed
    Map(BTreeMap<String, Option<Value>>),
    /// Environment as list of KEY=value strings
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(BTreeMap::new())
    }
}

impl Environment {
    /// Convert to a map regardless of input format.
    ///
    /// A list entry without `=` and a map entry without a value both yield `None`.
    pub fn to_map(&self) -> BTreeMap<String, Option<String>> {
        match self {
            Environment::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().and_then(scalar_to_string)))
                .collect(),
            Environment::List(list) => list
                .iter()
                .map(|s| match s.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (s.clone(), None),
                })
                .collect(),
        }
    }
}

/// Labels as a map or a `KEY=value` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Labels {
    Map(BTreeMap<String, Value>),
    List(Vec<String>),
}

impl Default for Labels {
    fn default() -> Self {
        Labels::Map(BTreeMap::new())
    }
}

impl Labels {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            Labels::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), scalar_to_string(v).unwrap_or_default()))
                .collect(),
            Labels::List(list) => list
                .iter()
                .map(|s| match s.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (s.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// `depends_on` as a list or as a map of conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOn::List(list) => list.clone(),
            DependsOn::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Service networks as a list or as a map of per-network options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Value>>),
}

impl Default for ServiceNetworks {
    fn default() -> Self {
        ServiceNetworks::List(Vec::new())
    }
}

impl ServiceNetworks {
    pub fn names(&self) -> Vec<String> {
        match self {
            ServiceNetworks::List(list) => list.clone(),
            ServiceNetworks::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Port entry in short or long syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Short(String),
    Long(PortLong),
}

/// Long port syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortLong {
    pub target: u16,

    #[serde(default)]
    pub published: Option<Value>,

    #[serde(default)]
    pub host_ip: Option<String>,

    #[serde(default)]
    pub protocol: Option<String>,
}

/// Service volume entry in short or long syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceVolume {
    Short(String),
    Long(VolumeLong),
}

/// Long volume syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeLong {
    /// `volume` or `bind`; inferred from the source when absent
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    #[serde(default)]
    pub source: Option<String>,

    pub target: String,

    #[serde(default)]
    pub read_only: bool,

    /// Remaining keys, including `x-*` extensions
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Secret grant in short or long syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSecret {
    Short(String),
    Long {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl ServiceSecret {
    pub fn source(&self) -> &str {
        match self {
            ServiceSecret::Short(s) => s,
            ServiceSecret::Long { source, .. } => source,
        }
    }

    /// File name under `/run/secrets`; defaults to the source name.
    pub fn target(&self) -> &str {
        match self {
            ServiceSecret::Short(s) => s,
            ServiceSecret::Long { source, target } => target.as_deref().unwrap_or(source),
        }
    }
}

/// Volume definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDefinition {
    /// Volume driver to use
    #[serde(default)]
    pub driver: Option<String>,

    /// Driver-specific options; `pool` selects the storage pool
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,

    /// Remaining keys, including `x-*` extensions
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Network definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Network driver to use
    #[serde(default)]
    pub driver: Option<String>,

    /// Use an existing network under this name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub external: Option<Value>,
}

/// Secret definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretDefinition {
    /// Host file holding the secret
    #[serde(default)]
    pub file: Option<String>,
}

/// Render a YAML scalar the way it was written.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => serde_yaml::to_string(other).ok().map(|s| s.trim_end().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_to_map_from_list() {
        let env = Environment::List(vec!["ENV=production".to_string(), "BARE".to_string()]);
        let map = env.to_map();
        assert_eq!(map.get("ENV"), Some(&Some("production".to_string())));
        assert_eq!(map.get("BARE"), Some(&None));
    }

    #[test]
    fn test_environment_to_map_from_map() {
        let env: Environment = serde_yaml::from_str("ENV: prod\nPORT: 8080\nEMPTY:\n").unwrap();
        let map = env.to_map();
        assert_eq!(map["ENV"], Some("prod".to_string()));
        assert_eq!(map["PORT"], Some("8080".to_string()));
        assert_eq!(map["EMPTY"], None);
    }

    #[test]
    fn test_depends_on_forms() {
        let list: DependsOn = serde_yaml::from_str("[db, cache]").unwrap();
        assert_eq!(list.names(), vec!["db", "cache"]);
        let map: DependsOn =
            serde_yaml::from_str("db:\n  condition: service_healthy\n").unwrap();
        assert_eq!(map.names(), vec!["db"]);
    }

    #[test]
    fn test_secret_target_defaults_to_source() {
        let short: ServiceSecret = serde_yaml::from_str("token").unwrap();
        assert_eq!(short.target(), "token");
        let long: ServiceSecret = serde_yaml::from_str("source: token\ntarget: api_key").unwrap();
        assert_eq!(long.source(), "token");
        assert_eq!(long.target(), "api_key");
    }

    #[test]
    fn test_labels_list() {
        let labels: Labels = serde_yaml::from_str("[\"tier=web\", \"team\"]").unwrap();
        let map = labels.to_map();
        assert_eq!(map["tier"], "web");
        assert_eq!(map["team"], "");
    }
}
