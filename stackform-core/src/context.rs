//! Per-invocation orchestration context.
//!
//! Everything a reconciler needs besides the stack itself: the remote
//! configuration, the connector, the effective project, and the cancellation
//! signal. Connections are memoized per remote name for the lifetime of the
//! context, which is one command invocation.

use crate::config::RemoteConfig;
use crate::control::{Connector, ControlPlane};
use crate::error::{Result, StackError};
use crate::types::{Service, Stack, DEFAULT_PROJECT};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

pub struct OrchestratorContext {
    config: RemoteConfig,
    connector: Arc<dyn Connector>,
    project: String,
    working_dir: PathBuf,
    connections: Mutex<HashMap<String, Arc<dyn ControlPlane>>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl OrchestratorContext {
    pub fn new(
        config: RemoteConfig,
        connector: Arc<dyn Connector>,
        project: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            connector,
            project: project.into(),
            working_dir: working_dir.into(),
            connections: Mutex::new(HashMap::new()),
            cancel: None,
        }
    }

    /// Context for `stack`.
    ///
    /// The stack's project wins unless it is the implicit default and the
    /// configuration carries an override.
    pub fn for_stack(config: RemoteConfig, connector: Arc<dyn Connector>, stack: &Stack) -> Self {
        let project = match &config.project_override {
            Some(project) if stack.project == DEFAULT_PROJECT => project.clone(),
            _ => stack.project.clone(),
        };
        let working_dir = stack.working_dir.clone();
        Self::new(config, connector, project, working_dir)
    }

    /// Abort between services once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Connection to `remote`, opened on first use.
    pub fn connect(&self, remote: &str) -> Result<Arc<dyn ControlPlane>> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = connections.get(remote) {
            return Ok(client.clone());
        }
        debug!(remote, "Opening control-plane connection");
        let client = self.connector.connect(remote)?;
        connections.insert(remote.to_string(), client.clone());
        Ok(client)
    }

    /// Remote and instance name backing `service`.
    pub fn instance_remote(&self, service: &Service) -> (String, String) {
        self.config.parse_remote(service.instance_name())
    }

    /// Connection and instance name for `service`.
    pub fn client_for(&self, service: &Service) -> Result<(Arc<dyn ControlPlane>, String)> {
        let (remote, instance) = self.instance_remote(service);
        Ok((self.connect(&remote)?, instance))
    }

    /// Fail with `Cancelled` when the caller asked to stop.
    pub fn check_cancelled(&self, next_service: &str) -> Result<()> {
        match &self.cancel {
            Some(cancel) if *cancel.borrow() => {
                Err(StackError::Cancelled { next_service: next_service.to_string() })
            }
            _ => Ok(()),
        }
    }
}
