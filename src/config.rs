use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::ports::AllocationStrategy;

/// Top-level configuration for devgate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and storage settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Port packing parameters
    #[serde(default)]
    pub ports: PortConfig,

    /// How dev server containers are launched
    #[serde(default)]
    pub containers: ContainerConfig,

    /// Subdomain routing
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Lifecycle timers and per-user limits
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the subdomain reverse proxy listens on (0 disables it)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// SQLite database holding users, projects and their settings
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Maximum idle connections kept per dev server (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            proxy_port: default_proxy_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            database_path: default_database_path(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    /// First port considered by the packing search
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Window width for block-based allocations
    #[serde(default = "default_block_size")]
    pub block_size: u16,

    /// Window width for spaced allocations
    #[serde(default = "default_space_size")]
    pub space_size: u16,

    /// Distance from frontend to backend in a spaced window
    #[serde(default = "default_spaced_backend_offset")]
    pub spaced_backend_offset: u16,

    /// How many ports past `base_port` the search may scan
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,

    /// Strategy used when a dev server start needs fresh ports
    #[serde(default)]
    pub default_strategy: AllocationStrategy,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            block_size: default_block_size(),
            space_size: default_space_size(),
            spaced_backend_offset: default_spaced_backend_offset(),
            search_limit: default_search_limit(),
            default_strategy: AllocationStrategy::default(),
        }
    }
}

impl PortConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_port < 1024 {
            return Err(format!(
                "ports: 'base_port' must be at least 1024 (got {})",
                self.base_port
            ));
        }
        if self.block_size < 2 {
            return Err("ports: 'block_size' must leave room for frontend and backend".into());
        }
        if self.spaced_backend_offset == 0 || self.spaced_backend_offset >= self.space_size {
            return Err(format!(
                "ports: 'spaced_backend_offset' must be within 1..{} (got {})",
                self.space_size, self.spaced_backend_offset
            ));
        }
        if self.search_limit == 0 {
            return Err("ports: 'search_limit' must be greater than 0".into());
        }
        Ok(())
    }
}

/// Image pull policy for dev server containers
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// Container settings shared by every project's dev server
///
/// # Security Warning
///
/// `image` and `command` decide what runs for every project. Configuration
/// files must be readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    /// Image the dev server runs in
    #[serde(default = "default_image")]
    pub image: String,

    /// Command override; the image default is used when empty
    #[serde(default)]
    pub command: Vec<String>,

    /// Port the dev server listens on inside the container.
    /// Defaults to the project's allocated backend port
    pub container_port: Option<u16>,

    /// Host directory holding one subdirectory per project id
    pub workspace_root: Option<String>,

    /// Where the project workspace is mounted inside the container
    #[serde(default = "default_workspace_mount")]
    pub workspace_mount: String,

    /// Docker host URL (default: local socket)
    pub docker_host: Option<String>,

    /// Docker network to connect to (default: bridge)
    pub network: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit (e.g., "512m", "1g")
    #[serde(default = "default_memory")]
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    #[serde(default = "default_cpus")]
    pub cpus: Option<String>,

    /// Extra environment variables for every dev server
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Upper bound for creating and starting a container
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on stop
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// Upper bound for a whole stop call, grace period included
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: Vec::new(),
            container_port: None,
            workspace_root: None,
            workspace_mount: default_workspace_mount(),
            docker_host: None,
            network: None,
            pull_policy: PullPolicy::default(),
            memory: default_memory(),
            cpus: default_cpus(),
            env: HashMap::new(),
            start_timeout_secs: default_start_timeout(),
            stop_grace_period_secs: default_stop_grace_period(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl ContainerConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("containers: 'image' must not be empty".into());
        }
        if self.container_port == Some(0) {
            return Err("containers: 'container_port' must be greater than 0".into());
        }
        if self.stop_timeout_secs < self.stop_grace_period_secs {
            return Err(format!(
                "containers: 'stop_timeout_secs' ({}) is shorter than 'stop_grace_period_secs' ({})",
                self.stop_timeout_secs, self.stop_grace_period_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Domain every project subdomain hangs off
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Whether public URLs use https
    #[serde(default)]
    pub ssl_enabled: bool,

    /// Timeout for a proxied request to a dev server
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for installing or removing a route
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            ssl_enabled: false,
            request_timeout_secs: default_request_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Delay before a freshly started server is reported as running
    #[serde(default = "default_start_grace_period")]
    pub start_grace_period_ms: u64,

    /// Running servers older than this are reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle reaper wakes up
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Cap enforced by the per-user scaling trigger
    #[serde(default = "default_max_servers_per_user")]
    pub max_servers_per_user: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_grace_period_ms: default_start_grace_period(),
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_servers_per_user: default_max_servers_per_user(),
        }
    }
}

impl OrchestratorConfig {
    pub fn start_grace_period(&self) -> Duration {
        Duration::from_millis(self.start_grace_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_admin_port() -> u16 {
    9999
}

fn default_database_path() -> String {
    "devgate.db".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_base_port() -> u16 {
    5200
}

fn default_block_size() -> u16 {
    10
}

fn default_space_size() -> u16 {
    20
}

fn default_spaced_backend_offset() -> u16 {
    10
}

fn default_search_limit() -> u32 {
    10_000
}

fn default_image() -> String {
    "node:20-alpine".to_string()
}

fn default_workspace_mount() -> String {
    "/workspace".to_string()
}

fn default_memory() -> Option<String> {
    Some("512m".to_string())
}

fn default_cpus() -> Option<String> {
    Some("0.5".to_string())
}

fn default_start_timeout() -> u64 {
    60
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    10
}

fn default_start_grace_period() -> u64 {
    2000 // long enough for most dev servers to bind their port
}

fn default_idle_timeout() -> u64 {
    2 * 60 * 60
}

fn default_cleanup_interval() -> u64 {
    5 * 60
}

fn default_max_servers_per_user() -> usize {
    3
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.ports.validate() {
            errors.push(e);
        }
        if let Err(e) = self.containers.validate() {
            errors.push(e);
        }
        if let Err(e) = crate::routes::normalize_domain(&self.proxy.base_domain) {
            errors.push(format!("proxy: 'base_domain' {}", e));
        }
        if self.orchestrator.cleanup_interval_secs == 0 {
            errors.push("orchestrator: 'cleanup_interval_secs' must be greater than 0".into());
        }
        if self.orchestrator.max_servers_per_user == 0 {
            errors.push("orchestrator: 'max_servers_per_user' must be greater than 0".into());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
proxy_port = 8000
bind = "127.0.0.1"
admin_port = 9000
database_path = "/var/lib/devgate/devgate.db"

[ports]
base_port = 6000
default_strategy = "block"

[containers]
image = "node:22"
command = ["npm", "run", "dev"]
workspace_root = "/srv/workspaces"
memory = "1g"

[containers.env]
NODE_ENV = "development"

[proxy]
base_domain = "dev.example.com"
ssl_enabled = true

[orchestrator]
idle_timeout_secs = 600
max_servers_per_user = 5
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.proxy_port, 8000);
        assert_eq!(config.server.database_path, "/var/lib/devgate/devgate.db");
        assert_eq!(config.ports.base_port, 6000);
        assert_eq!(config.ports.default_strategy, AllocationStrategy::BlockBased);
        assert_eq!(config.containers.command, vec!["npm", "run", "dev"]);
        assert_eq!(config.containers.memory.as_deref(), Some("1g"));
        assert_eq!(
            config.containers.env.get("NODE_ENV"),
            Some(&"development".to_string())
        );
        assert!(config.proxy.ssl_enabled);
        assert_eq!(config.orchestrator.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.orchestrator.max_servers_per_user, 5);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9999);
        assert_eq!(config.ports.base_port, 5200);
        assert_eq!(config.ports.block_size, 10);
        assert_eq!(config.ports.space_size, 20);
        assert_eq!(config.ports.spaced_backend_offset, 10);
        assert_eq!(config.ports.search_limit, 10_000);
        assert_eq!(config.ports.default_strategy, AllocationStrategy::Spaced);
        assert_eq!(config.containers.pull_policy, PullPolicy::IfNotPresent);
        assert_eq!(config.proxy.base_domain, "localhost");
        assert_eq!(
            config.orchestrator.start_grace_period(),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn test_pull_policy_aliases() {
        let config: ContainerConfig = toml::from_str(r#"pull_policy = "if-not-present""#).unwrap();
        assert_eq!(config.pull_policy, PullPolicy::IfNotPresent);

        let config: ContainerConfig = toml::from_str(r#"pull_policy = "never""#).unwrap();
        assert_eq!(config.pull_policy, PullPolicy::Never);
    }

    #[test]
    fn test_validate_port_settings() {
        let mut config = Config::default();
        config.ports.base_port = 80;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("base_port"));

        let mut config = Config::default();
        config.ports.spaced_backend_offset = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.containers.image = String::new();
        config.proxy.base_domain = "bad domain!".to_string();
        config.orchestrator.cleanup_interval_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("image"));
        assert!(err.contains("base_domain"));
        assert!(err.contains("cleanup_interval_secs"));
    }

    #[test]
    fn test_stop_timeout_must_cover_grace_period() {
        let mut config = Config::default();
        config.containers.stop_grace_period_secs = 60;
        config.containers.stop_timeout_secs = 5;
        assert!(config.validate().is_err());
    }
}
