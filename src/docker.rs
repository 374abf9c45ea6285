//! Docker runtime for dev server containers

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, Stats,
    StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ContainerConfig, PullPolicy};
use crate::container::{ContainerRuntime, ContainerSpec, CpuSample, StatsSnapshot};

/// Label carrying the owning project id
pub const PROJECT_LABEL: &str = "devgate.project";
/// Label carrying the user who started the container
pub const USER_LABEL: &str = "devgate.user";

/// Seconds bollard waits on a single Docker API call
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Docker-backed [`ContainerRuntime`]
pub struct DockerManager {
    client: Docker,
    pull_policy: PullPolicy,
    network: Option<String>,
    memory_bytes: Option<i64>,
    nano_cpus: Option<i64>,
}

impl DockerManager {
    /// Connect to the Docker daemon and check that it answers.
    ///
    /// Tries, in order: `docker_host` from config, `DOCKER_HOST`, then the
    /// usual socket locations for Linux and desktop installs.
    pub async fn connect(config: &ContainerConfig) -> anyhow::Result<Self> {
        let memory_bytes = config.memory.as_deref().map(parse_memory_limit).transpose()?;
        let nano_cpus = config.cpus.as_deref().map(parse_cpu_limit).transpose()?;

        let client = match config.docker_host.clone().or_else(|| std::env::var("DOCKER_HOST").ok()) {
            Some(host) => Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?,
            None => Self::connect_with_defaults().await?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd, Docker Desktop or Colima is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            pull_policy: config.pull_policy.clone(),
            network: config.network.clone(),
            memory_bytes,
            nano_cpus,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Ok(Docker::connect_with_socket(
                socket_path,
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Ok(Docker::connect_with_http(
                host,
                DOCKER_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?)
        } else {
            anyhow::bail!(
                "Invalid docker_host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let mut candidates = vec!["/var/run/docker.sock".to_string()];
        if !home.is_empty() {
            candidates.push(format!("{}/.docker/run/docker.sock", home));
            candidates.push(format!("{}/.colima/default/docker.sock", home));
        }

        for path in &candidates {
            if !std::path::Path::new(path).exists() {
                continue;
            }
            match Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
                Ok(client) if client.ping().await.is_ok() => {
                    debug!(path, "Using Docker socket");
                    return Ok(client);
                }
                Ok(_) => debug!(path, "Docker socket exists but daemon is not responding"),
                Err(e) => debug!(path, error = %e, "Cannot open Docker socket"),
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon (tried {}). Set DOCKER_HOST or containers.docker_host. Error: {}",
                candidates.join(", "),
                e
            )
        })
    }

    /// Make sure `image` is present locally, honoring the pull policy
    pub async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        let present = self.client.inspect_image(image).await.is_ok();
        let pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !present,
            PullPolicy::Never if present => false,
            PullPolicy::Never => anyhow::bail!(
                "Image '{}' is not available locally and pull_policy is 'never'",
                image
            ),
        };

        if !pull {
            debug!(image, "Image present locally");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.client.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
            if let Some(error) = update.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
            if let Some(status) = update.status {
                debug!(image, status, "Pull progress");
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, spec: &ContainerSpec) -> Config<String> {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let binds = spec.workspace.as_ref().map(|dir| {
            vec![format!("{}:{}", dir.display(), spec.workspace_mount)]
        });

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: self.network.clone(),
            memory: self.memory_bytes,
            nano_cpus: self.nano_cpus,
            binds,
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(PROJECT_LABEL.to_string(), spec.project_id.clone());
        labels.insert(USER_LABEL.to_string(), spec.user_id.clone());

        Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: spec.workspace.as_ref().map(|_| spec.workspace_mount.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.ensure_image(&spec.image).await?;

        // A container left behind by a crashed run would hold the name
        self.remove(&spec.name).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .client
            .create_container(Some(options), self.container_config(spec))
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("port is already allocated") {
                    anyhow::anyhow!("host port {} is already in use", spec.host_port)
                } else {
                    anyhow::anyhow!("failed to create container '{}': {}", spec.name, e)
                }
            })?;
        let container_id = response.id;
        debug!(project_id = %spec.project_id, container_id, "Created container");

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(remove_err) = self.remove(&container_id).await {
                warn!(
                    project_id = %spec.project_id,
                    container_id,
                    error = %remove_err,
                    "Failed to remove container after failed start"
                );
            }
            anyhow::bail!("failed to start container '{}': {}", spec.name, e);
        }

        info!(
            project_id = %spec.project_id,
            container_id,
            image = %spec.image,
            host_port = spec.host_port,
            "Started container"
        );
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => {
                info!(container_id, "Stopped container");
                Ok(())
            }
            // 304: already stopped, 404: already gone
            Err(BollardError::DockerResponseServerError { status_code: 304 | 404, .. }) => {
                debug!(container_id, "Container was not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("failed to stop container {}: {}", container_id, e)),
        }
    }

    async fn remove(&self, container: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(()) => {
                debug!(container, "Removed container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            // 409: removal already in progress
            Err(BollardError::DockerResponseServerError { status_code: 409, .. }) => {
                warn!(container, "Container removal already in progress");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("failed to remove container {}: {}", container, e)),
        }
    }

    async fn is_running(&self, container_id: &str) -> bool {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn stats(&self, container_id: &str) -> anyhow::Result<StatsSnapshot> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = Box::pin(self.client.stats(container_id, Some(options)));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("no stats returned for {}", container_id))??;

        Ok(snapshot_from(&stats))
    }
}

fn snapshot_from(stats: &Stats) -> StatsSnapshot {
    let sample = |cpu: &bollard::container::CPUStats| CpuSample {
        total_usage: cpu.cpu_usage.total_usage,
        system_usage: cpu.system_cpu_usage.unwrap_or(0),
        online_cpus: cpu
            .online_cpus
            .map(|n| n as u32)
            .or_else(|| cpu.cpu_usage.percpu_usage.as_ref().map(|v| v.len() as u32))
            .unwrap_or(1),
    };

    StatsSnapshot {
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        cpu: sample(&stats.cpu_stats),
        precpu: sample(&stats.precpu_stats),
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let normalized = limit.trim().to_lowercase();
    let normalized = normalized.strip_suffix('b').unwrap_or(normalized.as_str());

    let (digits, unit) = match normalized.chars().last() {
        Some('g') => (&normalized[..normalized.len() - 1], 1024 * 1024 * 1024i64),
        Some('m') => (&normalized[..normalized.len() - 1], 1024 * 1024i64),
        Some('k') => (&normalized[..normalized.len() - 1], 1024i64),
        _ => (normalized, 1i64),
    };

    let value: f64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;
    if value <= 0.0 {
        anyhow::bail!("Memory limit must be positive: {}", limit);
    }

    Ok((value * unit as f64) as i64)
}

/// Parse a CPU count ("0.5", "2") into Docker nano-CPUs
pub fn parse_cpu_limit(cpus: &str) -> anyhow::Result<i64> {
    let count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
    if count <= 0.0 {
        anyhow::bail!("CPU limit must be positive: {}", cpus);
    }
    Ok((count * 1_000_000_000.0) as i64)
}
