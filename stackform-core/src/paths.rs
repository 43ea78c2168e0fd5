//! Centralized path resolution for stackform.
//!
//! The remote configuration is shared with the control plane's own client, so
//! stackform reads it from the same directory that client uses.

use std::path::{Path, PathBuf};

/// Compose file names probed in the working directory, in priority order.
pub const COMPOSE_FILE_NAMES: [&str; 4] =
    ["compose.yaml", "compose.yml", "docker-compose.yaml", "docker-compose.yml"];

/// Get the client configuration directory.
///
/// Resolution order:
/// 1. `STACKFORM_CONF` environment variable
/// 2. `INCUS_CONF` environment variable
/// 3. `~/.config/incus`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STACKFORM_CONF") {
        return PathBuf::from(dir);
    }

    if let Ok(dir) = std::env::var("INCUS_CONF") {
        return PathBuf::from(dir);
    }

    dirs::home_dir()
        .map(|h| h.join(".config").join("incus"))
        .unwrap_or_else(|| PathBuf::from("/etc/incus"))
}

/// Get the remote configuration file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yml")
}

/// Client certificate used to authenticate against HTTPS remotes.
pub fn client_cert(dir: &Path) -> PathBuf {
    dir.join("client.crt")
}

/// Client private key matching [`client_cert`].
pub fn client_key(dir: &Path) -> PathBuf {
    dir.join("client.key")
}

/// Pinned server certificate for a remote, if the user accepted one.
pub fn server_cert(dir: &Path, remote: &str) -> PathBuf {
    dir.join("servercerts").join(format!("{}.crt", remote))
}

/// Local directory holding copies of a service's secret files.
pub fn secrets_dir(working_dir: &Path, service: &str) -> PathBuf {
    working_dir.join(".secrets").join(service)
}

/// Find the compose file in `dir`, if any.
pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILE_NAMES.iter().map(|name| dir.join(name)).find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_compose_file_prefers_compose_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}").unwrap();
        std::fs::write(dir.path().join("compose.yaml"), "services: {}").unwrap();

        let found = find_compose_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "compose.yaml");
    }

    #[test]
    fn test_find_compose_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(find_compose_file(dir.path()).is_none());
    }

    #[test]
    fn test_secrets_dir_layout() {
        let dir = secrets_dir(Path::new("/srv/app"), "web");
        assert_eq!(dir, PathBuf::from("/srv/app/.secrets/web"));
    }
}
