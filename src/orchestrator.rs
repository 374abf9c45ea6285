//! Dev server orchestration
//!
//! Composes the port allocator, container manager and proxy manager into
//! start/stop/status for a project's dev server, and keeps the in-memory
//! registry that says which dev servers are up.
//!
//! Start runs ports → container → route. If the route cannot be created the
//! container is stopped again before the error is returned, so a failed start
//! never leaves a container running without a way to reach it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::container::{ContainerManager, ResourceUsage};
use crate::error::{Error, Result};
use crate::ports::{AllocationStrategy, PortAllocation, PortAllocator, PortAvailability};
use crate::routes::ProxyManager;
use crate::store::{ProjectConfigStore, ProjectInfo, UserInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    /// Starting or running: a start request should short-circuit
    pub fn is_active(self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Stopped,
}

/// One project's dev server as tracked by the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct DevServerRecord {
    pub project_id: String,
    pub user_id: String,
    pub container_id: String,
    pub port: u16,
    pub status: ServerStatus,
    pub custom_domain: Option<String>,
    pub public_url: Option<String>,
    pub last_started: DateTime<Utc>,
    pub resource_usage: ResourceUsage,
}

/// What a start request returns
#[derive(Debug, Clone, Serialize)]
pub struct StartedServer {
    pub project_id: String,
    pub port: u16,
    pub url: Option<String>,
    pub custom_domain: Option<String>,
    pub container_id: String,
    pub status: ServerStatus,
}

impl From<&DevServerRecord> for StartedServer {
    fn from(record: &DevServerRecord) -> Self {
        Self {
            project_id: record.project_id.clone(),
            port: record.port,
            url: record.public_url.clone(),
            custom_domain: record.custom_domain.clone(),
            container_id: record.container_id.clone(),
            status: record.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project_id: String,
    pub is_running: bool,
    pub status: ServerStatus,
    pub health: Health,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub custom_domain: Option<String>,
    pub last_started: Option<DateTime<Utc>>,
    pub resource_usage: Option<ResourceUsage>,
}

/// Fleet-wide snapshot, recomputed on every call
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorMetrics {
    pub total_servers: usize,
    pub running_servers: usize,
    pub starting_servers: usize,
    pub error_servers: usize,
    pub total_memory_bytes: u64,
    pub average_cpu_percent: f64,
    pub active_routes: usize,
    pub running_containers: usize,
    pub allocated_projects: usize,
}

/// Clears the sweep flag when an idle sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DevServerOrchestrator {
    store: Arc<dyn ProjectConfigStore>,
    ports: Arc<PortAllocator>,
    containers: Arc<ContainerManager>,
    proxy: Arc<ProxyManager>,
    config: OrchestratorConfig,
    servers: DashMap<String, DevServerRecord>,
    sweeping: AtomicBool,
}

impl DevServerOrchestrator {
    /// Returns `Arc<Self>`: start spawns a task that promotes the record
    /// to running once the grace period is over.
    pub fn new(
        store: Arc<dyn ProjectConfigStore>,
        ports: Arc<PortAllocator>,
        containers: Arc<ContainerManager>,
        proxy: Arc<ProxyManager>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            ports,
            containers,
            proxy,
            config,
            servers: DashMap::new(),
            sweeping: AtomicBool::new(false),
        })
    }

    /// Start the project's dev server, or return it if it is already up
    pub async fn start(self: &Arc<Self>, project_id: &str, user_id: &str) -> Result<StartedServer> {
        let existing = self.servers.get(project_id).map(|r| r.clone());
        if let Some(record) = existing.filter(|r| r.status.is_active()) {
            debug!(project_id, status = ?record.status, "Dev server already up");
            return Ok(StartedServer::from(&record));
        }

        let project = self.lookup_project(project_id)?;
        let user = self.lookup_user(user_id)?;

        self.ports
            .allocate(project_id, &project.name, self.ports.config().default_strategy)?;

        let container = self.containers.start(project_id, user_id).await?;

        let Some(route) = self
            .proxy
            .create_route(project_id, &project.name, user_id, &user.username, container.port)
            .await
        else {
            warn!(
                project_id,
                container_id = %container.container_id,
                "Route creation failed, stopping container"
            );
            if !self.containers.stop(project_id).await {
                error!(
                    project_id,
                    container_id = %container.container_id,
                    "Rollback failed, container may still be running"
                );
            }
            return Err(Error::ProxyCreate(format!(
                "could not route project {} to port {}",
                project_id, container.port
            )));
        };

        let record = DevServerRecord {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            container_id: container.container_id,
            port: container.port,
            status: ServerStatus::Starting,
            custom_domain: Some(route.full_domain.clone()),
            public_url: Some(route.public_url()),
            last_started: Utc::now(),
            resource_usage: ResourceUsage::default(),
        };
        self.servers
            .insert(project_id.to_string(), record.clone());

        info!(
            project_id,
            user_id,
            port = record.port,
            domain = %route.full_domain,
            "Dev server starting"
        );

        self.schedule_promotion(project_id.to_string(), record.container_id.clone());
        Ok(StartedServer::from(&record))
    }

    fn schedule_promotion(self: &Arc<Self>, project_id: String, container_id: String) {
        let this = Arc::clone(self);
        let grace = self.config.start_grace_period();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let usage = this.containers.stats(&project_id).await;

            if let Some(mut record) = this.servers.get_mut(&project_id) {
                if record.container_id == container_id && record.status == ServerStatus::Starting {
                    record.status = ServerStatus::Running;
                    if let Some(usage) = usage {
                        record.resource_usage = usage;
                    }
                    debug!(project_id = %project_id, "Dev server running");
                }
            }
        });
    }

    /// Stop the project's dev server. False when nothing was tracked or
    /// neither the container nor the route could be torn down.
    pub async fn stop(&self, project_id: &str) -> bool {
        let Some(record) = self.servers.get(project_id).map(|r| r.clone()) else {
            return false;
        };

        let (container_stopped, route_removed) = tokio::join!(
            self.containers.stop(project_id),
            self.proxy.remove_route(project_id)
        );

        if !container_stopped && !route_removed {
            warn!(project_id, "Failed to stop dev server");
            return false;
        }
        if !container_stopped || !route_removed {
            warn!(project_id, container_stopped, route_removed, "Dev server only partly torn down");
        }

        self.servers
            .remove_if(project_id, |_, r| r.container_id == record.container_id);
        info!(project_id, "Dev server stopped");
        true
    }

    /// Status with a live container probe. A record whose container is gone
    /// is marked as errored.
    pub async fn status(&self, project_id: &str) -> StatusReport {
        let record = self.servers.get(project_id).map(|r| r.clone());
        let running = self.containers.is_running(project_id).await;
        let usage = if running {
            self.containers.stats(project_id).await
        } else {
            None
        };

        let health = match (running, &record) {
            (true, _) => Health::Healthy,
            (false, Some(_)) => Health::Unhealthy,
            (false, None) => Health::Stopped,
        };

        let status = match &record {
            Some(record) => {
                let mut status = record.status;
                if let Some(mut live) = self.servers.get_mut(project_id) {
                    if live.container_id == record.container_id {
                        if !running && live.status != ServerStatus::Error {
                            warn!(project_id, container_id = %live.container_id, "Dev server container is not running");
                            live.status = ServerStatus::Error;
                        }
                        if let Some(usage) = usage {
                            live.resource_usage = usage;
                        }
                        status = live.status;
                    }
                }
                status
            }
            None if running => ServerStatus::Running,
            None => ServerStatus::Stopped,
        };

        let route = self.proxy.get_route(project_id);
        StatusReport {
            project_id: project_id.to_string(),
            is_running: running,
            status,
            health,
            port: record.as_ref().map(|r| r.port),
            url: route.as_ref().map(|r| r.public_url()),
            custom_domain: route.map(|r| r.full_domain),
            last_started: record.as_ref().map(|r| r.last_started),
            resource_usage: usage,
        }
    }

    /// Stop every running dev server started more than `max_idle` ago.
    ///
    /// Returns how many were stopped. A call made while another sweep is in
    /// progress does nothing and returns 0.
    pub async fn cleanup_idle(&self, max_idle: Duration) -> usize {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Idle sweep already in progress, skipping");
            return 0;
        }
        let _guard = SweepGuard(&self.sweeping);

        let now = Utc::now();
        let idle: Vec<(String, Duration)> = self
            .servers
            .iter()
            .filter(|r| r.status == ServerStatus::Running)
            .filter_map(|r| {
                let age = (now - r.last_started).to_std().unwrap_or(Duration::ZERO);
                (age > max_idle).then(|| (r.key().clone(), age))
            })
            .collect();

        let mut stopped = 0;
        for (project_id, age) in idle {
            info!(project_id = %project_id, idle_secs = age.as_secs(), "Dev server idle timeout reached");
            if self.stop(&project_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Periodically reap idle dev servers until shutdown
    pub async fn run_idle_reaper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.cleanup_interval();
        let max_idle = self.config.idle_timeout();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let stopped = self.cleanup_idle(max_idle).await;
                    if stopped > 0 {
                        info!(stopped, "Idle sweep stopped dev servers");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn metrics(&self) -> OrchestratorMetrics {
        self.refresh_usage().await;

        let mut metrics = OrchestratorMetrics {
            active_routes: self.proxy.route_count(),
            running_containers: self.containers.running_count().await,
            allocated_projects: self.ports.list().len(),
            ..OrchestratorMetrics::default()
        };

        let mut cpu_total = 0.0;
        for record in self.servers.iter() {
            metrics.total_servers += 1;
            match record.status {
                ServerStatus::Running => {
                    metrics.running_servers += 1;
                    metrics.total_memory_bytes += record.resource_usage.memory_bytes;
                    cpu_total += record.resource_usage.cpu_percent;
                }
                ServerStatus::Starting => metrics.starting_servers += 1,
                ServerStatus::Error => metrics.error_servers += 1,
                ServerStatus::Stopped => {}
            }
        }
        if metrics.running_servers > 0 {
            metrics.average_cpu_percent = cpu_total / metrics.running_servers as f64;
        }

        metrics
    }

    async fn refresh_usage(&self) {
        let running: Vec<String> = self
            .servers
            .iter()
            .filter(|r| r.status == ServerStatus::Running)
            .map(|r| r.key().clone())
            .collect();

        let readings = futures::future::join_all(
            running.iter().map(|project_id| self.containers.stats(project_id)),
        )
        .await;

        for (project_id, usage) in running.iter().zip(readings) {
            if let (Some(usage), Some(mut record)) = (usage, self.servers.get_mut(project_id)) {
                record.resource_usage = usage;
            }
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn get(&self, project_id: &str) -> Option<DevServerRecord> {
        self.servers.get(project_id).map(|r| r.clone())
    }

    /// All tracked dev servers, oldest start first
    pub fn list_servers(&self) -> Vec<DevServerRecord> {
        let mut servers: Vec<_> = self.servers.iter().map(|r| r.value().clone()).collect();
        servers.sort_by_key(|r| r.last_started);
        servers
    }

    pub fn list_user_servers(&self, user_id: &str) -> Vec<DevServerRecord> {
        self.list_servers()
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .collect()
    }

    /// Stop a user's oldest dev servers until they are within
    /// `max_servers_per_user`. Returns how many were stopped.
    pub async fn scale_user_servers(&self, user_id: &str) -> usize {
        let active: Vec<DevServerRecord> = self
            .list_user_servers(user_id)
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect();

        let limit = self.config.max_servers_per_user;
        if active.len() <= limit {
            return 0;
        }

        let excess = active.len() - limit;
        info!(user_id, active = active.len(), limit, "Scaling down user dev servers");

        let mut stopped = 0;
        for record in active.iter().take(excess) {
            if self.stop(&record.project_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn get_ports(&self, project_id: &str) -> Option<PortAllocation> {
        self.ports.get(project_id)
    }

    pub fn list_ports(&self) -> Vec<PortAllocation> {
        self.ports.list()
    }

    pub fn check_ports(&self, ports: &[u32]) -> Vec<PortAvailability> {
        self.ports.check_ports(ports)
    }

    /// Allocate ports for a project without starting it
    pub fn allocate_ports(
        &self,
        project_id: &str,
        strategy: Option<AllocationStrategy>,
    ) -> Result<PortAllocation> {
        let project = self.lookup_project(project_id)?;
        let strategy = strategy.unwrap_or(self.ports.config().default_strategy);
        self.ports.allocate(project_id, &project.name, strategy)
    }

    /// Reserve caller-chosen ports. Refused while the dev server is up,
    /// since its container is bound to the current backend port.
    pub fn reserve_ports(
        &self,
        project_id: &str,
        frontend: u32,
        backend: u32,
        reserved: &[u32],
    ) -> Result<PortAllocation> {
        let project = self.lookup_project(project_id)?;
        self.ensure_not_active(project_id)?;
        self.ports
            .reserve_explicit(project_id, &project.name, frontend, backend, reserved)
    }

    /// Release a project's ports. Refused while its dev server is up.
    pub fn release_ports(&self, project_id: &str) -> Result<bool> {
        self.ensure_not_active(project_id)?;
        self.ports.release(project_id)
    }

    /// Stop every dev server, for shutdown. Returns how many stopped.
    pub async fn stop_all(&self) -> usize {
        let projects: Vec<String> = self.servers.iter().map(|r| r.key().clone()).collect();
        let results = futures::future::join_all(projects.iter().map(|p| self.stop(p))).await;
        let stopped = results.into_iter().filter(|s| *s).count();

        // Containers whose record was never created, e.g. after a failed rollback
        let stragglers = self.containers.stop_all().await;
        if stragglers > 0 {
            warn!(stragglers, "Stopped untracked dev server containers");
        }
        stopped
    }

    fn ensure_not_active(&self, project_id: &str) -> Result<()> {
        match self.servers.get(project_id) {
            Some(record) if record.status.is_active() => Err(Error::PortConflict(format!(
                "dev server for project {} is running",
                project_id
            ))),
            _ => Ok(()),
        }
    }

    fn lookup_project(&self, project_id: &str) -> Result<ProjectInfo> {
        match self.store.get_project(project_id) {
            Ok(Some(project)) if !project.deleted => Ok(project),
            Ok(_) => Err(Error::ProjectNotFound(project_id.to_string())),
            Err(e) => Err(Error::Persistence(e.to_string())),
        }
    }

    fn lookup_user(&self, user_id: &str) -> Result<UserInfo> {
        match self.store.get_user(user_id) {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(Error::UserNotFound(user_id.to_string())),
            Err(e) => Err(Error::Persistence(e.to_string())),
        }
    }
}
