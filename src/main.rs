use anyhow::Context;
use devgate::admin::{AdminServer, PKG_NAME, VERSION};
use devgate::config::Config;
use devgate::container::{ContainerManager, ContainerRuntime};
use devgate::db::Database;
use devgate::docker::DockerManager;
use devgate::orchestrator::DevServerOrchestrator;
use devgate::pool::PoolConfig;
use devgate::ports::PortAllocator;
use devgate::proxy::{ProxyServer, RouteTable};
use devgate::routes::{ProxyManager, RouteBackend};
use devgate::store::ProjectConfigStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().context("invalid log directive")?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("devgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db = Database::open(&config.server.database_path)
        .with_context(|| format!("Failed to open database '{}'", config.server.database_path))?;
    let store: Arc<dyn ProjectConfigStore> = Arc::new(db);

    let ports = PortAllocator::open(Arc::clone(&store), config.ports.clone())?;
    info!(allocations = ports.list().len(), "Port allocations restored");

    let docker = DockerManager::connect(&config.containers).await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let containers = Arc::new(ContainerManager::new(
        runtime,
        Arc::clone(&ports),
        config.containers.clone(),
    ));

    let route_table = Arc::new(RouteTable::new());
    let backend: Arc<dyn RouteBackend> = route_table.clone();
    let proxy = Arc::new(ProxyManager::new(backend, config.proxy.clone())?);

    let orchestrator = DevServerOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&ports),
        containers,
        proxy,
        config.orchestrator.clone(),
    );

    let proxy_handle = if config.server.proxy_port > 0 {
        let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.proxy_port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = config.server.proxy_port, error = %e, "Invalid proxy bind address");
                anyhow::anyhow!("Invalid proxy bind address: {}", e)
            })?;

        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };

        let proxy_server = ProxyServer::new(
            proxy_addr,
            route_table,
            config.proxy.request_timeout(),
            pool_config,
            shutdown_rx.clone(),
        );

        Some(tokio::spawn(async move {
            if let Err(e) = proxy_server.run().await {
                error!(error = %e, "Proxy server error");
            }
        }))
    } else {
        None
    };

    // Admin API stays on loopback
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&orchestrator),
        shutdown_rx.clone(),
        admin_token,
    );

    let reaper = Arc::clone(&orchestrator);
    let reaper_shutdown_rx = shutdown_rx.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper.run_idle_reaper(reaper_shutdown_rx).await;
    });

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping all dev servers...");
    let stopped = orchestrator.stop_all().await;
    info!(stopped, "Dev servers stopped");

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = proxy_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev server gateway");
    info!(
        bind = %config.server.bind,
        proxy_port = if config.server.proxy_port > 0 { Some(config.server.proxy_port) } else { None },
        admin_port = config.server.admin_port,
        database = %config.server.database_path,
        "Server configuration"
    );
    info!(
        base_port = config.ports.base_port,
        block_size = config.ports.block_size,
        space_size = config.ports.space_size,
        strategy = %config.ports.default_strategy,
        "Port allocation settings"
    );
    info!(
        image = %config.containers.image,
        pull_policy = ?config.containers.pull_policy,
        memory = ?config.containers.memory,
        cpus = ?config.containers.cpus,
        "Container settings"
    );
    info!(
        base_domain = %config.proxy.base_domain,
        ssl = config.proxy.ssl_enabled,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Routing settings"
    );
    info!(
        idle_timeout_secs = config.orchestrator.idle_timeout_secs,
        cleanup_interval_secs = config.orchestrator.cleanup_interval_secs,
        max_servers_per_user = config.orchestrator.max_servers_per_user,
        "Lifecycle settings"
    );
}
