//! Container lifecycle for project dev servers
//!
//! [`ContainerManager`] tracks at most one container per project, bound to
//! the project's allocated backend port. The container backend itself sits
//! behind [`ContainerRuntime`]; Docker is the production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::ports::{PortAllocation, PortAllocator};

/// Upper bound for liveness and stats probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a runtime needs to launch one project's dev server
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Stable per-project container name
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host port, always the project's backend port
    pub host_port: u16,
    /// Port the dev server listens on inside the container
    pub container_port: u16,
    pub env: Vec<(String, String)>,
    /// Host directory mounted at `workspace_mount`
    pub workspace: Option<PathBuf>,
    pub workspace_mount: String,
}

/// Cumulative CPU counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuSample {
    pub total_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

/// Raw stats reading: current counters plus the previous sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub memory_bytes: u64,
    pub cpu: CpuSample,
    pub precpu: CpuSample,
}

impl StatsSnapshot {
    /// CPU usage in percent of one core, summed over cores.
    /// Zero when either counter went backwards or did not move.
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu.total_usage as f64 - self.precpu.total_usage as f64;
        let system_delta = self.cpu.system_usage as f64 - self.precpu.system_usage as f64;
        if cpu_delta <= 0.0 || system_delta <= 0.0 {
            return 0.0;
        }
        let cpus = self.cpu.online_cpus.max(1) as f64;
        cpu_delta / system_delta * cpus * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

impl From<StatsSnapshot> for ResourceUsage {
    fn from(snapshot: StatsSnapshot) -> Self {
        Self {
            memory_bytes: snapshot.memory_bytes,
            cpu_percent: snapshot.cpu_percent(),
        }
    }
}

/// The container backend
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id
    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Stop a container, killing it after `grace`
    async fn stop(&self, container_id: &str, grace: Duration) -> anyhow::Result<()>;

    /// Remove a container by id or name. Removing a missing container succeeds.
    async fn remove(&self, container: &str) -> anyhow::Result<()>;

    async fn is_running(&self, container_id: &str) -> bool;

    async fn stats(&self, container_id: &str) -> anyhow::Result<StatsSnapshot>;
}

/// A tracked dev server container
#[derive(Debug, Clone, Serialize)]
pub struct ManagedContainer {
    pub project_id: String,
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    config: ContainerConfig,
    containers: DashMap<String, ManagedContainer>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        config: ContainerConfig,
    ) -> Self {
        Self {
            runtime,
            ports,
            config,
            containers: DashMap::new(),
        }
    }

    /// Start the project's dev server container, or return the one already running
    pub async fn start(&self, project_id: &str, user_id: &str) -> Result<ManagedContainer> {
        let existing = self.containers.get(project_id).map(|c| c.clone());
        if let Some(existing) = existing {
            if self.probe(&existing.container_id).await {
                debug!(project_id, container_id = %existing.container_id, "Container already running");
                return Ok(existing);
            }

            warn!(
                project_id,
                container_id = %existing.container_id,
                "Tracked container is no longer running, replacing it"
            );
            self.containers
                .remove_if(project_id, |_, c| c.container_id == existing.container_id);
            self.remove_quietly(&existing.container_id).await;
        }

        let allocation = self.ports.get(project_id).ok_or_else(|| {
            Error::ContainerStart(format!("project {} has no port allocation", project_id))
        })?;
        let spec = self.spec_for(project_id, user_id, &allocation);

        let started = timeout(self.config.start_timeout(), self.runtime.start(&spec)).await;
        let container_id = match started {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                warn!(project_id, container_name = %spec.name, error = %e, "Container start failed");
                self.remove_quietly(&spec.name).await;
                return Err(Error::ContainerStart(e.to_string()));
            }
            Err(_) => {
                warn!(
                    project_id,
                    container_name = %spec.name,
                    timeout_secs = self.config.start_timeout_secs,
                    "Container start timed out"
                );
                self.remove_quietly(&spec.name).await;
                return Err(Error::ContainerStart(format!(
                    "timed out after {}s",
                    self.config.start_timeout_secs
                )));
            }
        };

        let managed = ManagedContainer {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            container_id,
            container_name: spec.name,
            port: spec.host_port,
            started_at: Utc::now(),
        };
        self.containers
            .insert(project_id.to_string(), managed.clone());

        info!(
            project_id,
            container_id = %managed.container_id,
            port = managed.port,
            "Dev server container started"
        );
        Ok(managed)
    }

    /// Stop and remove the project's container.
    ///
    /// Returns false when nothing was tracked or the runtime failed; in the
    /// latter case the entry is kept so the stop can be retried.
    pub async fn stop(&self, project_id: &str) -> bool {
        let Some(managed) = self.containers.get(project_id).map(|c| c.clone()) else {
            return false;
        };
        let container_id = managed.container_id.as_str();

        let result = timeout(self.config.stop_timeout(), async {
            self.runtime
                .stop(container_id, self.config.stop_grace_period())
                .await?;
            self.runtime.remove(container_id).await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.containers
                    .remove_if(project_id, |_, c| c.container_id == managed.container_id);
                info!(project_id, container_id, "Dev server container stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(project_id, container_id, error = %e, "Failed to stop container");
                false
            }
            Err(_) => {
                warn!(
                    project_id,
                    container_id,
                    timeout_secs = self.config.stop_timeout_secs,
                    "Container stop timed out"
                );
                false
            }
        }
    }

    /// Live probe of the project's container
    pub async fn is_running(&self, project_id: &str) -> bool {
        let Some(container_id) = self.container_id(project_id) else {
            return false;
        };
        self.probe(&container_id).await
    }

    /// Current resource usage, or None when the container is not running
    pub async fn stats(&self, project_id: &str) -> Option<ResourceUsage> {
        let container_id = self.container_id(project_id)?;
        if !self.probe(&container_id).await {
            return None;
        }

        match timeout(PROBE_TIMEOUT, self.runtime.stats(&container_id)).await {
            Ok(Ok(snapshot)) => Some(snapshot.into()),
            Ok(Err(e)) => {
                warn!(project_id, container_id = %container_id, error = %e, "Failed to read container stats");
                None
            }
            Err(_) => {
                warn!(project_id, container_id = %container_id, "Container stats timed out");
                None
            }
        }
    }

    pub fn get(&self, project_id: &str) -> Option<ManagedContainer> {
        self.containers.get(project_id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<ManagedContainer> {
        self.containers.iter().map(|c| c.value().clone()).collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.containers.len()
    }

    /// How many tracked containers answer a live probe
    pub async fn running_count(&self) -> usize {
        let ids: Vec<String> = self
            .containers
            .iter()
            .map(|c| c.container_id.clone())
            .collect();
        let probes = futures::future::join_all(ids.iter().map(|id| self.probe(id))).await;
        probes.into_iter().filter(|running| *running).count()
    }

    /// Stop every tracked container. Returns how many stopped cleanly.
    pub async fn stop_all(&self) -> usize {
        let projects: Vec<String> = self.containers.iter().map(|c| c.key().clone()).collect();
        let results = futures::future::join_all(projects.iter().map(|p| self.stop(p))).await;
        results.into_iter().filter(|stopped| *stopped).count()
    }

    fn container_id(&self, project_id: &str) -> Option<String> {
        self.containers
            .get(project_id)
            .map(|c| c.container_id.clone())
    }

    async fn probe(&self, container_id: &str) -> bool {
        timeout(PROBE_TIMEOUT, self.runtime.is_running(container_id))
            .await
            .unwrap_or(false)
    }

    async fn remove_quietly(&self, container: &str) {
        match timeout(PROBE_TIMEOUT, self.runtime.remove(container)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(container, error = %e, "Failed to remove container"),
            Err(_) => warn!(container, "Container removal timed out"),
        }
    }

    fn spec_for(&self, project_id: &str, user_id: &str, allocation: &PortAllocation) -> ContainerSpec {
        let container_port = self.config.container_port.unwrap_or(allocation.backend_port);

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env.push(("PORT".into(), container_port.to_string()));
        env.push(("HOST".into(), "0.0.0.0".into()));
        env.push(("DEVGATE_PROJECT_ID".into(), project_id.to_string()));
        env.push(("DEVGATE_FRONTEND_PORT".into(), allocation.frontend_port.to_string()));
        env.push(("DEVGATE_BACKEND_PORT".into(), allocation.backend_port.to_string()));

        let workspace = self
            .config
            .workspace_root
            .as_ref()
            .map(|root| PathBuf::from(root).join(project_id));

        ContainerSpec {
            name: container_name(project_id),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            host_port: allocation.backend_port,
            container_port,
            env,
            workspace,
            workspace_mount: self.config.workspace_mount.clone(),
        }
    }
}

/// Docker-safe container name for a project
pub fn container_name(project_id: &str) -> String {
    let safe: String = project_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("devgate-{}", safe)
}
