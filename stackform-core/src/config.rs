//! Remote configuration.
//!
//! Mirrors the control plane client's `config.yml`: a default remote plus a map
//! of named remotes. The file is read once per invocation and never written.

use crate::error::{Result, StackError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Protocol spoken by a remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    /// Full instance-management API.
    #[default]
    Incus,
    /// Read-only image index (public image servers).
    Simplestreams,
    /// OCI registry used as an image source.
    Oci,
}

impl RemoteProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incus => "incus",
            Self::Simplestreams => "simplestreams",
            Self::Oci => "oci",
        }
    }
}

/// A named remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    /// Address, e.g. `https://10.0.0.2:8443` or `unix://`.
    pub addr: String,

    #[serde(default)]
    pub protocol: RemoteProtocol,

    #[serde(default)]
    pub public: bool,
}

/// Persistent remote configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(rename = "default-remote", default = "default_remote_name")]
    pub default_remote: String,

    #[serde(default)]
    pub remotes: BTreeMap<String, Remote>,

    /// Directory the file was loaded from; certificates are resolved relative to it.
    #[serde(skip)]
    pub dir: PathBuf,

    /// Project forced by the environment or command line.
    #[serde(skip)]
    pub project_override: Option<String>,
}

fn default_remote_name() -> String {
    "local".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let mut remotes = BTreeMap::new();
        remotes.insert(
            "local".to_string(),
            Remote { addr: "unix://".to_string(), protocol: RemoteProtocol::Incus, public: false },
        );
        remotes.insert(
            "images".to_string(),
            Remote {
                addr: "https://images.linuxcontainers.org".to_string(),
                protocol: RemoteProtocol::Simplestreams,
                public: true,
            },
        );
        Self {
            default_remote: default_remote_name(),
            remotes,
            dir: paths::config_dir(),
            project_override: None,
        }
    }
}

impl RemoteConfig {
    /// Load the configuration from the default location.
    ///
    /// A missing file yields the built-in defaults. `INCUS_PROJECT` sets the
    /// project override.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_file())?;
        if let Ok(project) = std::env::var("INCUS_PROJECT") {
            if !project.is_empty() {
                config.project_override = Some(project);
            }
        }
        Ok(config)
    }

    /// Load the configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !path.exists() {
            debug!(path = %path.display(), "No remote configuration, using defaults");
            return Ok(Self { dir, ..Self::default() });
        }

        let content = std::fs::read_to_string(path).map_err(|e| StackError::InvalidConfig {
            reason: format!("Failed to read {}: {}", path.display(), e),
        })?;
        let mut config = Self::parse(&content)?;
        config.dir = dir;
        Ok(config)
    }

    /// Parse configuration YAML. The public `images` remote is always available.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(content).map_err(|e| {
            StackError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        if let Some(images) = Self::default().remotes.remove("images") {
            config.remotes.entry("images".to_string()).or_insert(images);
        }
        Ok(config)
    }

    /// Look up a remote by name.
    pub fn remote(&self, name: &str) -> Result<&Remote> {
        self.remotes.get(name).ok_or_else(|| StackError::Connection {
            remote: name.to_string(),
            reason: "remote is not configured".to_string(),
        })
    }

    /// Split `remote:name` into its parts.
    ///
    /// A prefix that is not a configured remote is kept as part of the name, and
    /// references without a remote resolve against the default remote.
    pub fn parse_remote(&self, raw: &str) -> (String, String) {
        if let Some((prefix, rest)) = raw.split_once(':') {
            if self.remotes.contains_key(prefix) {
                return (prefix.to_string(), rest.to_string());
            }
        }
        (self.default_remote.clone(), raw.to_string())
    }

    pub fn with_project_override(mut self, project: Option<String>) -> Self {
        if project.is_some() {
            self.project_override = project;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default-remote: lab
remotes:
  lab:
    addr: https://10.0.0.2:8443
  mirror:
    addr: https://mirror.example.org
    protocol: simplestreams
    public: true
"#;

    #[test]
    fn test_parse_sample() {
        let config = RemoteConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.default_remote, "lab");
        assert_eq!(config.remote("lab").unwrap().protocol, RemoteProtocol::Incus);
        assert_eq!(config.remote("mirror").unwrap().protocol, RemoteProtocol::Simplestreams);
        // images is always available
        assert!(config.remote("images").is_ok());
    }

    #[test]
    fn test_parse_remote_prefix() {
        let config = RemoteConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.parse_remote("mirror:debian/12"), ("mirror".into(), "debian/12".into()));
        assert_eq!(config.parse_remote("web"), ("lab".into(), "web".into()));
        assert_eq!(config.parse_remote("docker.io/nginx:1.25"), ("lab".into(), "docker.io/nginx:1.25".into()));
    }

    #[test]
    fn test_unknown_remote_is_connection_error() {
        let config = RemoteConfig::default();
        let err = config.remote("nowhere").unwrap_err();
        assert!(matches!(err, StackError::Connection { ref remote, .. } if remote == "nowhere"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RemoteConfig::load_from(&dir.path().join("config.yml")).unwrap();
        assert_eq!(config.default_remote, "local");
        assert_eq!(config.dir, dir.path());
    }
}
