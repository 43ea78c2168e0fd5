//! Compose file to stack converter.
//!
//! Converts parsed compose structures into the immutable [`Stack`] model:
//! resolves extensions, splits mounts into volumes and binds, resolves pools and
//! relative paths, and builds the dependency graph.

use super::extensions::{self, Extension};
use super::types::*;
use crate::error::{Result, StackError};
use crate::types::{
    Bind, PortMapping, Protocol, Secret, Service, SnapshotPolicy, Stack, Volume, DEFAULT_POOL,
    DEFAULT_PROJECT,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Caller-provided overrides for loading a stack.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Compose file, relative to the working directory
    pub file: Option<PathBuf>,

    /// Stack name, overriding the manifest
    pub project_name: Option<String>,

    /// Control-plane project, overriding `x-incus-project`
    pub project: Option<String>,
}

/// Settings of a top-level named volume.
#[derive(Debug, Default)]
struct NamedVolume {
    pool: Option<String>,
    snapshot: Option<SnapshotPolicy>,
    shift: bool,
}

/// Converter for compose files to stacks.
pub struct ComposeConverter;

impl ComposeConverter {
    /// Convert a parsed compose file loaded from `manifest`.
    ///
    /// Relative paths resolve against the manifest's directory. Dangling or
    /// cyclic dependencies fail here, before anything touches a remote.
    #[instrument(skip(compose, options), fields(manifest = %manifest.display()))]
    pub fn convert(compose: ComposeFile, manifest: &Path, options: &LoadOptions) -> Result<Stack> {
        info!("Converting compose file to stack");

        let working_dir = manifest.parent().map(Path::to_path_buf).unwrap_or_default();
        let invalid = |reason: String| StackError::InvalidManifest { path: manifest.to_path_buf(), reason };

        let name = Self::stack_name(&compose, &working_dir, options).map_err(invalid)?;

        let mut project = DEFAULT_PROJECT.to_string();
        let mut profiles = Vec::new();
        for ext in extensions::parse_all(&compose.extra) {
            match ext {
                Extension::DefaultProfiles(list) => profiles = list,
                Extension::Project(p) => project = p,
                other if other.report("top level") => {
                    warn!(extension = ?other, "Extension does not apply at the top level, ignoring")
                }
                _ => {}
            }
        }
        if let Some(p) = options.project.as_ref().filter(|p| !p.is_empty()) {
            project = p.clone();
        }

        let named_volumes = Self::named_volumes(&compose.volumes);
        let networks = Self::network_names(&compose.networks);

        let mut secret_files = BTreeMap::new();
        for (secret, def) in &compose.secrets {
            let file = def
                .file
                .as_deref()
                .ok_or_else(|| invalid(format!("secret '{}' has no file", secret)))?;
            secret_files.insert(secret.clone(), resolve_path(&working_dir, file));
        }

        let mut services = Vec::with_capacity(compose.services.len());
        for (service_name, svc) in &compose.services {
            let service = Self::convert_service(
                service_name,
                svc,
                &working_dir,
                &named_volumes,
                &networks,
                &secret_files,
            )
            .map_err(invalid)?;
            services.push(service);
        }

        let stack = Stack::new(name, services)?
            .with_project(project)
            .with_profiles(profiles)
            .with_secret_files(secret_files)
            .with_export_path(working_dir.clone())
            .with_working_dir(working_dir);

        info!(
            stack = %stack.name,
            project = %stack.project,
            services = stack.services().len(),
            "Loaded stack"
        );
        Ok(stack)
    }

    /// `--project-name`, then top-level `name:`, then the directory name.
    fn stack_name(
        compose: &ComposeFile,
        working_dir: &Path,
        options: &LoadOptions,
    ) -> std::result::Result<String, String> {
        let raw = options
            .project_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| compose.name.clone().filter(|n| !n.is_empty()))
            .or_else(|| {
                working_dir
                    .canonicalize()
                    .ok()
                    .unwrap_or_else(|| working_dir.to_path_buf())
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .ok_or_else(|| "cannot determine a project name".to_string())?;

        let normalized = normalize_project_name(&raw);
        if normalized.is_empty() {
            return Err(format!("project name '{}' has no usable characters", raw));
        }
        Ok(normalized)
    }

    fn named_volumes(
        defs: &BTreeMap<String, Option<VolumeDefinition>>,
    ) -> BTreeMap<String, NamedVolume> {
        defs.iter()
            .map(|(name, def)| {
                let def = def.clone().unwrap_or_default();
                let mut named = NamedVolume {
                    pool: def.driver_opts.get("pool").filter(|p| !p.is_empty()).cloned(),
                    ..Default::default()
                };
                for ext in extensions::parse_all(&def.extra) {
                    match ext {
                        Extension::Snapshot(policy) => named.snapshot = Some(policy),
                        Extension::Shift(shift) => named.shift = shift,
                        other if other.report(name) => {
                            warn!(volume = %name, extension = ?other, "Extension does not apply to volumes, ignoring")
                        }
                        _ => {}
                    }
                }
                (name.clone(), named)
            })
            .collect()
    }

    /// Network key -> name on the control plane.
    fn network_names(defs: &BTreeMap<String, Option<NetworkDefinition>>) -> BTreeMap<String, String> {
        defs.iter()
            .map(|(key, def)| {
                let name = def.as_ref().and_then(|d| d.name.clone()).unwrap_or_else(|| key.clone());
                (key.clone(), name)
            })
            .collect()
    }

    #[instrument(skip_all, fields(service = %name))]
    fn convert_service(
        name: &str,
        svc: &ComposeService,
        working_dir: &Path,
        named_volumes: &BTreeMap<String, NamedVolume>,
        networks: &BTreeMap<String, String>,
        secret_files: &BTreeMap<String, PathBuf>,
    ) -> std::result::Result<Service, String> {
        let mut service = Service::new(name, svc.image.clone());
        service.container_name = svc.container_name.clone().filter(|n| !n.is_empty());
        service.depends_on = svc.depends_on.names().into_iter().collect();
        service.environment = svc.environment.to_map();
        service.labels = svc.labels.to_map();
        service.env_files = svc
            .env_file
            .as_ref()
            .map(|f| f.to_vec())
            .unwrap_or_default()
            .iter()
            .map(|f| resolve_path(working_dir, f))
            .collect();

        for ext in extensions::parse_all(&svc.extra) {
            match ext {
                Extension::AdditionalProfiles(list) => service.additional_profiles = list,
                Extension::Storage(pool) => service.storage = Some(pool),
                Extension::Gpu(gpu) => service.gpu = gpu,
                Extension::CloudInitUserData(data) => service.cloud_init_user_data = Some(data),
                Extension::CloudInitUserDataFile(file) => {
                    service.cloud_init_user_data_file = Some(resolve_path(working_dir, &file.to_string_lossy()))
                }
                Extension::Snapshot(policy) => service.snapshot = Some(policy),
                other if other.report(name) => {
                    warn!(extension = ?other, "Extension does not apply to services, ignoring")
                }
                _ => {}
            }
        }
        for key in svc.extra.keys().filter(|k| !k.starts_with("x-")) {
            debug!(key = %key, "Ignoring compose key");
        }

        for network in svc.networks.names() {
            let resolved = networks.get(&network).cloned().unwrap_or(network);
            if !service.networks.contains(&resolved) {
                service.networks.push(resolved);
            }
        }

        for port in &svc.ports {
            service.ports.push(parse_port(port)?);
        }

        for mount in &svc.volumes {
            Self::convert_mount(&mut service, mount, working_dir, named_volumes)?;
        }

        for grant in &svc.secrets {
            if !secret_files.contains_key(grant.source()) {
                return Err(format!(
                    "service '{}' refers to undefined secret '{}'",
                    name,
                    grant.source()
                ));
            }
            service.secrets.insert(
                grant.target().to_string(),
                Secret { source: grant.source().to_string(), target: grant.target().to_string() },
            );
        }

        Ok(service)
    }

    fn convert_mount(
        service: &mut Service,
        mount: &ServiceVolume,
        working_dir: &Path,
        named_volumes: &BTreeMap<String, NamedVolume>,
    ) -> std::result::Result<(), String> {
        let (kind, source, target, read_only, shift) = match mount {
            ServiceVolume::Short(spec) => {
                let parts: Vec<&str> = spec.splitn(3, ':').collect();
                if parts.len() < 2 {
                    warn!(service = %service.name, mount = %spec, "Anonymous volumes are not supported, skipping");
                    return Ok(());
                }
                let read_only = parts.get(2).is_some_and(|mode| mode.split(',').any(|m| m == "ro"));
                let kind = if is_path(parts[0]) { "bind" } else { "volume" };
                (kind.to_string(), parts[0].to_string(), parts[1].to_string(), read_only, false)
            }
            ServiceVolume::Long(long) => {
                let Some(source) = long.source.clone().filter(|s| !s.is_empty()) else {
                    warn!(service = %service.name, target = %long.target, "Mount without a source is not supported, skipping");
                    return Ok(());
                };
                let kind = long
                    .kind
                    .clone()
                    .unwrap_or_else(|| if is_path(&source) { "bind" } else { "volume" }.to_string());
                let mut shift = false;
                for ext in extensions::parse_all(&long.extra) {
                    match ext {
                        Extension::Shift(s) => shift = s,
                        other if other.report(&source) => {
                            warn!(extension = ?other, "Extension does not apply to mounts, ignoring")
                        }
                        _ => {}
                    }
                }
                (kind, source, long.target.clone(), long.read_only, shift)
            }
        };

        match kind.as_str() {
            "volume" => {
                let named = named_volumes.get(&source).ok_or_else(|| {
                    format!("service '{}' refers to undefined volume '{}'", service.name, source)
                })?;
                let pool = named
                    .pool
                    .clone()
                    .or_else(|| service.storage.clone())
                    .unwrap_or_else(|| DEFAULT_POOL.to_string());
                let volume = Volume {
                    mountpoint: target,
                    pool,
                    snapshot: named.snapshot.clone(),
                    read_only,
                    shift: shift || named.shift,
                };
                service.volumes.insert(source, volume);
            }
            "bind" => {
                let source = resolve_path(working_dir, &source).to_string_lossy().into_owned();
                let bind = Bind { source, target, read_only, shift };
                let name = bind.device_name();
                if let Some(kept) = service.bind_mounts.get(&name) {
                    // one device per host path
                    warn!(
                        service = %service.name,
                        source = %bind.source,
                        "Host path already mounted at '{}', ignoring mount at '{}'",
                        kept.target,
                        bind.target
                    );
                } else {
                    service.bind_mounts.insert(name, bind);
                }
            }
            other => {
                warn!(service = %service.name, kind = other, "Unsupported mount type, skipping");
            }
        }
        Ok(())
    }
}

/// Lowercase, keeping only `[a-z0-9_-]`.
pub fn normalize_project_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn is_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

/// Resolve `~` and relative paths.
fn resolve_path(working_dir: &Path, raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let joined = working_dir.join(path);
    // drop `.` components so `./data` and `data` resolve identically
    joined.components().filter(|c| !matches!(c, std::path::Component::CurDir)).collect()
}

/// Parse a port entry: `TARGET`, `PUBLISHED:TARGET` or `IP:PUBLISHED:TARGET`,
/// each optionally followed by `/tcp` or `/udp`.
fn parse_port(entry: &PortEntry) -> std::result::Result<PortMapping, String> {
    match entry {
        PortEntry::Number(port) => Ok(PortMapping {
            host_ip: None,
            published: port.to_string(),
            target: *port,
            protocol: Protocol::Tcp,
        }),
        PortEntry::Long(long) => {
            let protocol = match long.protocol.as_deref() {
                Some(p) => p.parse::<Protocol>()?,
                None => Protocol::Tcp,
            };
            let published = long
                .published
                .as_ref()
                .and_then(scalar_to_string)
                .unwrap_or_else(|| long.target.to_string());
            Ok(PortMapping {
                host_ip: long.host_ip.clone().filter(|ip| !ip.is_empty()),
                published,
                target: long.target,
                protocol,
            })
        }
        PortEntry::Short(spec) => {
            let (addr, protocol) = match spec.rsplit_once('/') {
                Some((addr, proto)) => (addr, proto.parse::<Protocol>()?),
                None => (spec.as_str(), Protocol::Tcp),
            };
            let mut parts = addr.rsplitn(3, ':');
            let target_str = parts.next().unwrap_or_default();
            let target = target_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}': target must be a single port", spec))?;
            let published = parts.next().filter(|p| !p.is_empty()).unwrap_or(target_str).to_string();
            let host_ip = parts
                .next()
                .map(|ip| ip.trim_start_matches('[').trim_end_matches(']').to_string())
                .filter(|ip| !ip.is_empty());
            Ok(PortMapping { host_ip, published, target, protocol })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;

    fn convert(yaml: &str) -> Result<Stack> {
        let compose = ComposeParser::parse(yaml)?;
        ComposeConverter::convert(compose, Path::new("/srv/myapp/compose.yaml"), &LoadOptions::default())
    }

    #[test]
    fn test_convert_basic_service() {
        let stack = convert(
            r#"
services:
  web:
    image: images:debian/12
    container_name: frontend
"#,
        )
        .unwrap();

        assert_eq!(stack.name, "myapp");
        assert_eq!(stack.project, "default");
        assert_eq!(stack.working_dir, PathBuf::from("/srv/myapp"));
        let web = stack.service("web").unwrap();
        assert_eq!(web.image, "images:debian/12");
        assert_eq!(web.instance_name(), "frontend");
    }

    #[test]
    fn test_parse_ports() {
        let port = |s: &str| parse_port(&PortEntry::Short(s.to_string())).unwrap();

        let p = port("8080:80");
        assert_eq!((p.published.as_str(), p.target, p.host_ip.as_deref()), ("8080", 80, None));

        let p = port("127.0.0.1:5353:53/udp");
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.protocol, Protocol::Udp);
        assert_eq!(p.target, 53);

        let p = port("[::1]:8443:443");
        assert_eq!(p.host_ip.as_deref(), Some("::1"));

        assert_eq!(port("9000").published, "9000");
        assert!(parse_port(&PortEntry::Short("8000-8010:8000-8010".into())).is_err());
    }

    #[test]
    fn test_dependency_ordering() {
        let stack = convert(
            r#"
services:
  web:
    image: img
    depends_on: [api]
  api:
    image: img
    depends_on:
      db:
        condition: service_started
  db:
    image: img
"#,
        )
        .unwrap();
        assert_eq!(stack.bring_up_order().unwrap(), vec!["db", "api", "web"]);
        assert_eq!(stack.teardown_order().unwrap(), vec!["web", "api", "db"]);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let err = convert(
            r#"
services:
  a:
    image: img
    depends_on: [b]
  b:
    image: img
    depends_on: [a]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, StackError::CircularDependency { .. }));
    }

    #[test]
    fn test_missing_dependency_detection() {
        let err = convert(
            r#"
services:
  web:
    image: img
    depends_on: [db]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, StackError::UnknownDependency { ref dependency, .. } if dependency == "db"));
    }

    #[test]
    fn test_volume_pool_resolution() {
        let stack = convert(
            r#"
services:
  db:
    image: img
    x-incus-storage: ssd
    volumes:
      - cache:/data
      - logs:/var/log:ro
      - scratch:/tmp/scratch
  web:
    image: img
    volumes:
      - scratch:/scratch
volumes:
  cache:
    driver_opts:
      pool: fast
    x-incus-snapshot:
      schedule: "@daily"
  logs:
  scratch: {}
"#,
        )
        .unwrap();

        let db = stack.service("db").unwrap();
        assert_eq!(db.volumes["cache"].pool, "fast");
        assert_eq!(db.volumes["cache"].mountpoint, "/data");
        assert_eq!(db.volumes["cache"].snapshot.as_ref().unwrap().schedule.as_deref(), Some("@daily"));
        assert_eq!(db.volumes["logs"].pool, "ssd");
        assert!(db.volumes["logs"].read_only);
        assert_eq!(stack.service("web").unwrap().volumes["scratch"].pool, "default");
    }

    #[test]
    fn test_undefined_volume_is_invalid() {
        let err = convert(
            r#"
services:
  db:
    image: img
    volumes: ["missing:/data"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_bind_mounts() {
        let stack = convert(
            r#"
services:
  web:
    image: img
    volumes:
      - ./config:/etc/app:ro
      - type: bind
        source: /var/lib/shared
        target: /shared
        x-incus-shift: true
"#,
        )
        .unwrap();

        let web = stack.service("web").unwrap();
        assert!(web.volumes.is_empty());
        let config = &web.bind_mounts["srv-myapp-config"];
        assert_eq!(config.source, "/srv/myapp/config");
        assert!(config.read_only);
        let shared = &web.bind_mounts["var-lib-shared"];
        assert!(shared.shift);
        assert_eq!(shared.target, "/shared");
    }

    #[test]
    fn test_same_host_path_keeps_first_mount() {
        let stack = convert(
            r#"
services:
  web:
    image: img
    volumes:
      - ./config:/etc/app
      - ./config:/etc/app-copy:ro
"#,
        )
        .unwrap();

        let web = stack.service("web").unwrap();
        assert_eq!(web.bind_mounts.len(), 1);
        let config = &web.bind_mounts["srv-myapp-config"];
        assert_eq!(config.target, "/etc/app");
        assert!(!config.read_only);
    }

    #[test]
    fn test_extensions() {
        let stack = convert(
            r#"
name: Demo App
x-incus-project: lab
x-incus-default-profiles: [base, net]
x-incus-bogus: 1
services:
  gpu:
    image: img
    x-incus-gpu: true
    x-incus-additional-profiles: [nvidia]
    x-incus-cloud-init-user-data-file: cloud-init/gpu.yaml
    x-incus-snapshot:
      schedule: "@hourly"
      expiry: 1d
"#,
        )
        .unwrap();

        assert_eq!(stack.name, "demoapp");
        assert_eq!(stack.project, "lab");
        assert_eq!(stack.profiles, vec!["base", "net"]);
        let gpu = stack.service("gpu").unwrap();
        assert!(gpu.gpu);
        assert_eq!(gpu.additional_profiles, vec!["nvidia"]);
        assert_eq!(
            gpu.cloud_init_user_data_file.as_deref(),
            Some(Path::new("/srv/myapp/cloud-init/gpu.yaml"))
        );
        assert!(gpu.has_cloud_init());
        assert_eq!(gpu.snapshot.as_ref().unwrap().expiry.as_deref(), Some("1d"));
    }

    #[test]
    fn test_project_override_wins() {
        let compose = ComposeParser::parse("x-incus-project: lab\nservices:\n  a:\n    image: img\n").unwrap();
        let options = LoadOptions {
            project: Some("prod".into()),
            project_name: Some("custom".into()),
            ..Default::default()
        };
        let stack = ComposeConverter::convert(compose, Path::new("/srv/x/compose.yaml"), &options).unwrap();
        assert_eq!(stack.project, "prod");
        assert_eq!(stack.name, "custom");
    }

    #[test]
    fn test_secrets() {
        let stack = convert(
            r#"
services:
  api:
    image: img
    secrets:
      - db_password
      - source: api_token
        target: token
secrets:
  db_password:
    file: ./secrets/db.txt
  api_token:
    file: /etc/tokens/api
"#,
        )
        .unwrap();

        assert_eq!(stack.secret_files["db_password"], PathBuf::from("/srv/myapp/secrets/db.txt"));
        let api = stack.service("api").unwrap();
        assert_eq!(api.secrets["token"].source, "api_token");
        assert_eq!(api.secrets["db_password"].target, "db_password");
    }

    #[test]
    fn test_undefined_secret_is_invalid() {
        let err = convert("services:\n  api:\n    image: img\n    secrets: [nope]\n").unwrap_err();
        assert!(matches!(err, StackError::InvalidManifest { .. }));
    }

    #[test]
    fn test_networks_and_environment() {
        let stack = convert(
            r#"
services:
  web:
    image: img
    networks:
      front:
      default:
    environment:
      - MODE=prod
      - TOKEN
    env_file: web.env
networks:
  front:
    name: lan0
"#,
        )
        .unwrap();
        let web = stack.service("web").unwrap();
        assert_eq!(web.networks, vec!["default", "lan0"]);
        assert_eq!(web.environment["MODE"], Some("prod".into()));
        assert_eq!(web.environment["TOKEN"], None);
        assert_eq!(web.env_files, vec![PathBuf::from("/srv/myapp/web.env")]);
    }
}
