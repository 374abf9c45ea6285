//! Shared test doubles for devgate integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use devgate::config::{ContainerConfig, OrchestratorConfig, PortConfig, ProxyConfig};
use devgate::container::{ContainerManager, ContainerRuntime, ContainerSpec, CpuSample, StatsSnapshot};
use devgate::db::Database;
use devgate::orchestrator::{DevServerOrchestrator, ServerStatus};
use devgate::ports::PortAllocator;
use devgate::routes::{ProxyManager, ProxyRoute, RouteBackend};
use devgate::store::ProjectConfigStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory container runtime; "containers" are ids in a set
#[derive(Default)]
pub struct MockRuntime {
    pub running: Mutex<HashSet<String>>,
    pub started: Mutex<Vec<ContainerSpec>>,
    pub removed: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
}

impl MockRuntime {
    /// Simulate a container dying underneath us
    pub fn crash(&self, container_id: &str) {
        self.running.lock().remove(container_id);
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("no such image: {}", spec.image);
        }
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.running.lock().insert(id.clone());
        self.started.lock().push(spec.clone());
        Ok(id)
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> anyhow::Result<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("daemon refused to stop {}", container_id);
        }
        self.running.lock().remove(container_id);
        Ok(())
    }

    async fn remove(&self, container: &str) -> anyhow::Result<()> {
        self.removed.lock().push(container.to_string());
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> bool {
        self.running.lock().contains(container_id)
    }

    async fn stats(&self, _container_id: &str) -> anyhow::Result<StatsSnapshot> {
        Ok(StatsSnapshot {
            memory_bytes: 128 * 1024 * 1024,
            cpu: CpuSample { total_usage: 600, system_usage: 4000, online_cpus: 2 },
            precpu: CpuSample { total_usage: 400, system_usage: 2000, online_cpus: 2 },
        })
    }
}

/// Route backend that records rules and can be told to fail
#[derive(Default)]
pub struct MockRouteBackend {
    pub rules: Mutex<HashMap<String, u16>>,
    pub fail_install: AtomicBool,
    pub fail_remove: AtomicBool,
}

#[async_trait]
impl RouteBackend for MockRouteBackend {
    async fn install(&self, route: &ProxyRoute) -> anyhow::Result<()> {
        if self.fail_install.load(Ordering::SeqCst) {
            anyhow::bail!("route store unavailable");
        }
        self.rules
            .lock()
            .insert(route.full_domain.clone(), route.target_port);
        Ok(())
    }

    async fn remove(&self, full_domain: &str) -> anyhow::Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            anyhow::bail!("route store unavailable");
        }
        self.rules.lock().remove(full_domain);
        Ok(())
    }
}

/// A full orchestration stack over an in-memory database and mocks
pub struct Harness {
    pub db: Arc<Database>,
    pub runtime: Arc<MockRuntime>,
    pub backend: Arc<MockRouteBackend>,
    pub ports: Arc<PortAllocator>,
    pub containers: Arc<ContainerManager>,
    pub proxy: Arc<ProxyManager>,
    pub orchestrator: Arc<DevServerOrchestrator>,
}

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        start_grace_period_ms: 0,
        idle_timeout_secs: 3600,
        cleanup_interval_secs: 60,
        max_servers_per_user: 2,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(orchestrator_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.create_user("u1", "alice").unwrap();
        db.create_user("u2", "bob").unwrap();

        let store: Arc<dyn ProjectConfigStore> = db.clone();
        let ports = PortAllocator::open(Arc::clone(&store), PortConfig::default()).unwrap();

        let runtime = Arc::new(MockRuntime::default());
        let containers = Arc::new(ContainerManager::new(
            runtime.clone(),
            Arc::clone(&ports),
            ContainerConfig::default(),
        ));

        let backend = Arc::new(MockRouteBackend::default());
        let proxy = Arc::new(
            ProxyManager::new(
                backend.clone(),
                ProxyConfig {
                    base_domain: "dev.example.com".to_string(),
                    ..ProxyConfig::default()
                },
            )
            .unwrap(),
        );

        let orchestrator = DevServerOrchestrator::new(
            store,
            Arc::clone(&ports),
            Arc::clone(&containers),
            Arc::clone(&proxy),
            config,
        );

        Self {
            db,
            runtime,
            backend,
            ports,
            containers,
            proxy,
            orchestrator,
        }
    }

    pub fn add_project(&self, id: &str, name: &str, owner: &str) {
        self.db.create_project(id, name, owner).unwrap();
    }

    /// Wait for the grace-period task to promote a record to running
    pub async fn wait_until_running(&self, project_id: &str) {
        for _ in 0..100 {
            if let Some(record) = self.orchestrator.get(project_id) {
                if record.status == ServerStatus::Running {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dev server for {} never reached running", project_id);
    }
}

/// Bind to port 0 and hand back whatever the OS picked
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request and return the full response text
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    host: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        host,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);

    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response).to_string()
}
