//! HTTPS client for the instance-management REST API.
//!
//! Every request goes to `/1.0/...` with the project as a query parameter.
//! Asynchronous responses carry an operation URL which is waited on before the
//! verb returns, so callers observe completed operations only.

use super::*;
use crate::config::{Remote, RemoteConfig};
use crate::error::{ResourceKind, StackError};
use crate::paths;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

const API_PREFIX: &str = "/1.0";

/// Standard response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    operation: String,
}

/// Background operation as returned by `/wait`.
#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    name: String,
    status: String,
    #[serde(rename = "type", default)]
    instance_type: String,
    #[serde(default)]
    profiles: Vec<String>,
    #[serde(default)]
    config: BTreeMap<String, String>,
    #[serde(default)]
    devices: BTreeMap<String, Device>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    name: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
    #[serde(default)]
    used_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    name: String,
    #[serde(default)]
    managed: bool,
    #[serde(rename = "type", default)]
    network_type: String,
}

#[derive(Debug, Deserialize)]
struct RawVolume {
    name: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    fingerprint: String,
    #[serde(rename = "type", default)]
    image_type: String,
}

#[derive(Debug, Deserialize)]
struct RawAlias {
    target: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawState {
    #[serde(default)]
    network: Option<BTreeMap<String, RawInterface>>,
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    #[serde(default)]
    addresses: Vec<RawAddress>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    family: String,
    address: String,
}

/// What a request is about, for error reporting.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    operation: &'a str,
    kind: ResourceKind,
    name: &'a str,
}

impl<'a> Target<'a> {
    fn new(operation: &'a str, kind: ResourceKind, name: &'a str) -> Self {
        Self { operation, kind, name }
    }
}

/// [`ControlPlane`] backed by a remote HTTPS endpoint.
pub struct RestControlPlane {
    client: Client,
    base_url: String,
    remote: String,
}

impl RestControlPlane {
    /// Build a client for `remote`, authenticating with the client certificate
    /// from `dir` and trusting the pinned server certificate when present.
    pub fn new(name: &str, remote: &Remote, dir: &Path) -> Result<Self> {
        let connection_error = |reason: String| StackError::Connection { remote: name.to_string(), reason };

        let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));

        let cert = paths::client_cert(dir);
        let key = paths::client_key(dir);
        if cert.is_file() && key.is_file() {
            let mut pem = std::fs::read(&cert).map_err(|e| StackError::io(&cert, e))?;
            pem.extend(std::fs::read(&key).map_err(|e| StackError::io(&key, e))?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| connection_error(format!("Invalid client certificate: {}", e)))?;
            builder = builder.identity(identity);
        }

        let server_cert = paths::server_cert(dir, name);
        if server_cert.is_file() {
            let pem = std::fs::read(&server_cert).map_err(|e| StackError::io(&server_cert, e))?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| connection_error(format!("Invalid server certificate: {}", e)))?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| connection_error(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: remote.addr.trim_end_matches('/').to_string(),
            remote: name.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str, project: Option<&str>) -> RequestBuilder {
        let url = format!("{}{}{}", self.base_url, API_PREFIX, path);
        let builder = self.client.request(method, url);
        match project {
            Some(project) => builder.query(&[("project", project)]),
            None => builder,
        }
    }

    /// Send a request and decode the envelope, mapping HTTP failures to errors.
    async fn send(&self, builder: RequestBuilder, target: Target<'_>) -> Result<Envelope> {
        let response = builder.send().await.map_err(|e| StackError::Connection {
            remote: self.remote.clone(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        let envelope: Envelope = response.json().await.map_err(|e| {
            StackError::remote(target.operation, target.name, format!("Invalid response ({}): {}", status, e))
        })?;

        match status {
            s if s.is_success() && envelope.kind != "error" => Ok(envelope),
            StatusCode::NOT_FOUND => Err(StackError::NotFound { kind: target.kind, name: target.name.to_string() }),
            StatusCode::CONFLICT => {
                Err(StackError::AlreadyExists { kind: target.kind, name: target.name.to_string() })
            }
            _ => Err(StackError::remote(target.operation, target.name, envelope.error)),
        }
    }

    /// Wait for the operation behind an asynchronous response.
    async fn complete(&self, envelope: Envelope, project: Option<&str>, target: Target<'_>) -> Result<Value> {
        if envelope.kind != "async" || envelope.operation.is_empty() {
            return Ok(envelope.metadata);
        }

        let path = envelope.operation.trim_start_matches(API_PREFIX);
        debug!(operation = %path, "Waiting for remote operation");
        let waited = self
            .send(self.request(Method::GET, &format!("{}/wait", path), project).query(&[("timeout", "-1")]), target)
            .await?;
        let operation: Operation = serde_json::from_value(waited.metadata)
            .map_err(|e| StackError::remote(target.operation, target.name, e))?;

        if operation.status != "Success" {
            return Err(StackError::remote(target.operation, target.name, operation.err));
        }
        Ok(operation.metadata)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, project: Option<&str>, target: Target<'_>) -> Result<T> {
        let envelope = self.send(self.request(Method::GET, path, project), target).await?;
        serde_json::from_value(envelope.metadata).map_err(|e| StackError::remote(target.operation, target.name, e))
    }

    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        project: Option<&str>,
        target: Target<'_>,
    ) -> Result<Option<T>> {
        match self.get(path, project, target).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn names(&self, path: &str, project: Option<&str>, target: Target<'_>) -> Result<Vec<String>> {
        let urls: Vec<String> = self.get(path, project, target).await?;
        Ok(urls.iter().map(|url| last_segment(url)).collect())
    }

    /// Issue a mutating request and wait for it to finish.
    async fn mutate(
        &self,
        method: Method,
        path: &str,
        project: &str,
        body: Option<Value>,
        target: Target<'_>,
    ) -> Result<Value> {
        let mut builder = self.request(method, path, Some(project));
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let envelope = self.send(builder, target).await?;
        self.complete(envelope, Some(project), target).await
    }

    /// Stream a backup archive to `target_path`.
    async fn download(&self, path: &str, project: &str, target_path: &Path, target: Target<'_>) -> Result<u64> {
        let mut response = self
            .request(Method::GET, path, Some(project))
            .send()
            .await
            .map_err(|e| StackError::Connection { remote: self.remote.clone(), reason: e.to_string() })?;
        if !response.status().is_success() {
            return Err(StackError::remote(target.operation, target.name, response.status()));
        }

        let mut file = tokio::fs::File::create(target_path).await.map_err(|e| StackError::io(target_path, e))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| StackError::remote(target.operation, target.name, e))?
        {
            file.write_all(&chunk).await.map_err(|e| StackError::io(target_path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| StackError::io(target_path, e))?;
        Ok(written)
    }

    /// Create a backup under `base`, download it, then delete it.
    async fn export(
        &self,
        base: &str,
        project: &str,
        body: Value,
        backup: &str,
        target_path: &Path,
        target: Target<'_>,
    ) -> Result<u64> {
        self.mutate(Method::POST, &format!("{}/backups", base), project, Some(body), target).await?;

        let downloaded =
            self.download(&format!("{}/backups/{}/export", base, backup), project, target_path, target).await;

        let cleanup = Target::new("delete backup", ResourceKind::Backup, backup);
        if let Err(e) = self.mutate(Method::DELETE, &format!("{}/backups/{}", base, backup), project, None, cleanup).await {
            warn!(backup, error = %e, "Failed to delete server-side backup");
        }
        downloaded
    }
}

fn last_segment(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn snapshot_body(spec: &SnapshotSpec) -> Value {
    let mut body = json!({ "name": spec.name, "stateful": spec.stateful });
    if let Some(expires_at) = spec.expires_at {
        body["expires_at"] = json!(expires_at.to_rfc3339());
    }
    body
}

/// Exit code of a finished exec operation.
fn exit_code(metadata: &Value, instance: &str) -> Result<i64> {
    metadata
        .get("return")
        .and_then(Value::as_i64)
        .ok_or_else(|| StackError::remote("exec in", instance, "missing return code"))
}

/// Backup request body. `only_key` is `instance_only` or `volume_only`.
fn backup_body(backup: &BackupSpec, only_key: &str) -> Value {
    let mut body = json!({
        "name": backup.name,
        "expires_at": backup.expires_at.to_rfc3339(),
        "optimized_storage": false,
    });
    body[only_key] = json!(backup.without_snapshots);
    body
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    async fn project_names(&self) -> Result<Vec<String>> {
        self.names("/projects", None, Target::new("list projects", ResourceKind::Project, "")).await
    }

    async fn profile_names(&self, project: &str) -> Result<Vec<String>> {
        self.names("/profiles", Some(project), Target::new("list profiles", ResourceKind::Project, project)).await
    }

    async fn profile(&self, project: &str, name: &str) -> Result<Option<ProfileInfo>> {
        let raw: Option<RawProfile> = self
            .get_optional(&format!("/profiles/{}", name), Some(project), Target::new("get profile", ResourceKind::Profile, name))
            .await?;
        Ok(raw.map(|p| ProfileInfo { name: p.name, config: p.config, used_by: p.used_by }))
    }

    #[instrument(skip(self, spec), fields(profile = %spec.name))]
    async fn create_profile(&self, project: &str, spec: &ProfileSpec) -> Result<()> {
        let body = json!({ "name": spec.name, "description": spec.description, "config": spec.config });
        self.mutate(Method::POST, "/profiles", project, Some(body), Target::new("create profile", ResourceKind::Profile, &spec.name))
            .await
            .map(|_| ())
    }

    async fn delete_profile(&self, project: &str, name: &str) -> Result<()> {
        self.mutate(
            Method::DELETE,
            &format!("/profiles/{}", name),
            project,
            None,
            Target::new("delete profile", ResourceKind::Profile, name),
        )
        .await
        .map(|_| ())
    }

    async fn storage_pool_names(&self) -> Result<Vec<String>> {
        self.names("/storage-pools", None, Target::new("list storage pools", ResourceKind::StoragePool, "")).await
    }

    async fn network_names(&self, project: &str) -> Result<Vec<String>> {
        self.names("/networks", Some(project), Target::new("list networks", ResourceKind::Project, project)).await
    }

    async fn network(&self, project: &str, name: &str) -> Result<Option<NetworkInfo>> {
        let raw: Option<RawNetwork> = self
            .get_optional(&format!("/networks/{}", name), Some(project), Target::new("get network", ResourceKind::Network, name))
            .await?;
        Ok(raw.map(|n| NetworkInfo { name: n.name, managed: n.managed, network_type: n.network_type }))
    }

    async fn image_alias(&self, project: &str, alias: &str) -> Result<Option<String>> {
        let raw: Option<RawAlias> = self
            .get_optional(&format!("/images/aliases/{}", alias), Some(project), Target::new("get image alias", ResourceKind::Image, alias))
            .await?;
        Ok(raw.map(|a| a.target))
    }

    async fn image(&self, project: &str, fingerprint: &str) -> Result<Option<ImageInfo>> {
        let raw: Option<RawImage> = self
            .get_optional(&format!("/images/{}", fingerprint), Some(project), Target::new("get image", ResourceKind::Image, fingerprint))
            .await?;
        Ok(raw.map(|i| ImageInfo { fingerprint: i.fingerprint, image_type: i.image_type }))
    }

    async fn instance(&self, project: &str, name: &str) -> Result<Option<InstanceInfo>> {
        let raw: Option<RawInstance> = self
            .get_optional(&format!("/instances/{}", name), Some(project), Target::new("get instance", ResourceKind::Instance, name))
            .await?;
        Ok(raw.map(|i| InstanceInfo {
            name: i.name,
            status: InstanceStatus::parse(&i.status),
            instance_type: i.instance_type,
            profiles: i.profiles,
            config: i.config,
            devices: i.devices,
        }))
    }

    async fn instance_state(&self, project: &str, name: &str) -> Result<Option<InstanceState>> {
        let raw: Option<RawState> = self
            .get_optional(
                &format!("/instances/{}/state", name),
                Some(project),
                Target::new("get instance state", ResourceKind::Instance, name),
            )
            .await?;
        Ok(raw.map(|state| {
            let ipv4 = state
                .network
                .unwrap_or_default()
                .into_iter()
                .filter(|(iface, _)| iface != "lo")
                .map(|(iface, net)| {
                    let addrs = net
                        .addresses
                        .into_iter()
                        .filter(|a| a.family == "inet")
                        .map(|a| a.address)
                        .collect();
                    (iface, addrs)
                })
                .collect();
            InstanceState { ipv4 }
        }))
    }

    #[instrument(skip(self, spec), fields(instance = %spec.name))]
    async fn create_instance(&self, project: &str, spec: &InstanceSpec) -> Result<()> {
        let mut source = json!({ "type": "image", "protocol": spec.source.protocol.as_str() });
        if let Some(server) = &spec.source.server {
            source["server"] = json!(server);
        }
        if let Some(alias) = &spec.source.alias {
            source["alias"] = json!(alias);
        }
        if let Some(fingerprint) = &spec.source.fingerprint {
            source["fingerprint"] = json!(fingerprint);
        }
        let body = json!({
            "name": spec.name,
            "description": spec.description,
            "type": spec.instance_type,
            "source": source,
            "profiles": spec.profiles,
            "config": spec.config,
            "devices": spec.devices,
        });
        self.mutate(Method::POST, "/instances", project, Some(body), Target::new("create instance", ResourceKind::Instance, &spec.name))
            .await
            .map(|_| ())
    }

    async fn update_instance_state(&self, project: &str, name: &str, change: &StateChange) -> Result<()> {
        let body = json!({
            "action": change.action.as_str(),
            "timeout": change.timeout,
            "force": change.force,
            "stateful": change.stateful,
        });
        self.mutate(
            Method::PUT,
            &format!("/instances/{}/state", name),
            project,
            Some(body),
            Target::new(change.action.as_str(), ResourceKind::Instance, name),
        )
        .await
        .map(|_| ())
    }

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        self.mutate(
            Method::DELETE,
            &format!("/instances/{}", name),
            project,
            None,
            Target::new("delete instance", ResourceKind::Instance, name),
        )
        .await
        .map(|_| ())
    }

    async fn add_device(&self, project: &str, instance: &str, name: &str, device: &Device) -> Result<()> {
        let path = format!("/instances/{}", instance);
        let target = Target::new("add device to", ResourceKind::Instance, instance);
        let mut current: Value = self.get(&path, Some(project), target).await?;

        let devices = current
            .get_mut("devices")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| StackError::remote(target.operation, instance, "instance has no device map"))?;
        if devices.contains_key(name) {
            return Err(StackError::AlreadyExists {
                kind: ResourceKind::Device,
                name: format!("{}/{}", instance, name),
            });
        }
        devices.insert(name.to_string(), json!(device));

        self.mutate(Method::PUT, &path, project, Some(current), target).await.map(|_| ())
    }

    async fn exec(&self, project: &str, instance: &str, command: &[String]) -> Result<i64> {
        let body = json!({
            "command": command,
            "wait-for-websocket": false,
            "interactive": false,
            "record-output": false,
            "environment": {},
        });
        let metadata = self
            .mutate(
                Method::POST,
                &format!("/instances/{}/exec", instance),
                project,
                Some(body),
                Target::new("exec in", ResourceKind::Instance, instance),
            )
            .await?;
        exit_code(&metadata, instance)
    }

    async fn storage_volume(&self, project: &str, pool: &str, name: &str) -> Result<Option<VolumeInfo>> {
        let raw: Option<RawVolume> = self
            .get_optional(
                &format!("/storage-pools/{}/volumes/custom/{}", pool, name),
                Some(project),
                Target::new("get volume", ResourceKind::Volume, name),
            )
            .await?;
        Ok(raw.map(|v| VolumeInfo { name: v.name, pool: pool.to_string(), content_type: v.content_type, config: v.config }))
    }

    #[instrument(skip(self, spec), fields(volume = %spec.name))]
    async fn create_storage_volume(&self, project: &str, pool: &str, spec: &VolumeSpec) -> Result<()> {
        let body = json!({
            "name": spec.name,
            "type": "custom",
            "content_type": spec.content_type,
            "config": spec.config,
        });
        self.mutate(
            Method::POST,
            &format!("/storage-pools/{}/volumes", pool),
            project,
            Some(body),
            Target::new("create volume", ResourceKind::Volume, &spec.name),
        )
        .await
        .map(|_| ())
    }

    async fn delete_storage_volume(&self, project: &str, pool: &str, name: &str) -> Result<()> {
        self.mutate(
            Method::DELETE,
            &format!("/storage-pools/{}/volumes/custom/{}", pool, name),
            project,
            None,
            Target::new("delete volume", ResourceKind::Volume, name),
        )
        .await
        .map(|_| ())
    }

    async fn create_instance_snapshot(&self, project: &str, instance: &str, spec: &SnapshotSpec) -> Result<()> {
        self.mutate(
            Method::POST,
            &format!("/instances/{}/snapshots", instance),
            project,
            Some(snapshot_body(spec)),
            Target::new("snapshot", ResourceKind::Instance, instance),
        )
        .await
        .map(|_| ())
    }

    async fn create_volume_snapshot(
        &self,
        project: &str,
        pool: &str,
        volume: &str,
        spec: &SnapshotSpec,
    ) -> Result<()> {
        let mut body = snapshot_body(spec);
        if let Some(map) = body.as_object_mut() {
            map.remove("stateful");
        }
        self.mutate(
            Method::POST,
            &format!("/storage-pools/{}/volumes/custom/{}/snapshots", pool, volume),
            project,
            Some(body),
            Target::new("snapshot", ResourceKind::Volume, volume),
        )
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, backup, target), fields(backup = %backup.name))]
    async fn export_instance(
        &self,
        project: &str,
        instance: &str,
        backup: &BackupSpec,
        target: &Path,
    ) -> Result<u64> {
        let body = backup_body(backup, "instance_only");
        self.export(
            &format!("/instances/{}", instance),
            project,
            body,
            &backup.name,
            target,
            Target::new("export", ResourceKind::Instance, instance),
        )
        .await
    }

    #[instrument(skip(self, backup, target), fields(backup = %backup.name))]
    async fn export_volume(
        &self,
        project: &str,
        pool: &str,
        volume: &str,
        backup: &BackupSpec,
        target: &Path,
    ) -> Result<u64> {
        let body = backup_body(backup, "volume_only");
        self.export(
            &format!("/storage-pools/{}/volumes/custom/{}", pool, volume),
            project,
            body,
            &backup.name,
            target,
            Target::new("export", ResourceKind::Volume, volume),
        )
        .await
    }
}

/// [`Connector`] that opens [`RestControlPlane`]s from the remote configuration.
#[derive(Debug, Clone)]
pub struct RestConnector {
    config: RemoteConfig,
}

impl RestConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

impl Connector for RestConnector {
    fn connect(&self, remote: &str) -> Result<Arc<dyn ControlPlane>> {
        let entry = self.config.remote(remote)?;
        if entry.protocol != RemoteProtocol::Incus {
            return Err(StackError::Connection {
                remote: remote.to_string(),
                reason: format!("remote speaks {}, not the instance API", entry.protocol.as_str()),
            });
        }
        if !entry.addr.starts_with("https://") {
            return Err(StackError::Connection {
                remote: remote.to_string(),
                reason: format!("unsupported address '{}', add an HTTPS remote", entry.addr),
            });
        }
        debug!(remote, addr = %entry.addr, "Connecting to remote");
        Ok(Arc::new(RestControlPlane::new(remote, entry, &self.config.dir)?))
    }
}
