//! Subdomain routes for project dev servers
//!
//! Each running dev server is reachable at `<user>-<project>.<base_domain>`.
//! [`ProxyManager`] owns the project → route map and pushes rules into a
//! [`RouteBackend`]; the in-process reverse proxy's route table is the
//! production backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;

/// Longest DNS label
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyRoute {
    pub project_id: String,
    pub user_id: String,
    pub subdomain: String,
    pub full_domain: String,
    pub target_port: u16,
    pub ssl_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ProxyRoute {
    pub fn public_url(&self) -> String {
        let scheme = if self.ssl_enabled { "https" } else { "http" };
        format!("{}://{}", scheme, self.full_domain)
    }
}

/// Where routing rules are installed
#[async_trait]
pub trait RouteBackend: Send + Sync {
    /// Route `route.full_domain` to `route.target_port`, replacing any existing rule
    async fn install(&self, route: &ProxyRoute) -> anyhow::Result<()>;

    /// Drop the rule for a domain. Removing an unknown domain succeeds.
    async fn remove(&self, full_domain: &str) -> anyhow::Result<()>;
}

pub struct ProxyManager {
    backend: Arc<dyn RouteBackend>,
    config: ProxyConfig,
    base_domain: String,
    routes: Mutex<HashMap<String, ProxyRoute>>,
}

impl ProxyManager {
    pub fn new(backend: Arc<dyn RouteBackend>, config: ProxyConfig) -> anyhow::Result<Self> {
        let base_domain = normalize_domain(&config.base_domain)?;
        Ok(Self {
            backend,
            config,
            base_domain,
            routes: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Route a generated subdomain to `target_port`.
    ///
    /// A project that already has a route keeps its subdomain and is
    /// re-pointed. Returns None when the backend rejects the rule or times
    /// out; the subdomain is then free again.
    pub async fn create_route(
        &self,
        project_id: &str,
        project_name: &str,
        user_id: &str,
        username: &str,
        target_port: u16,
    ) -> Option<ProxyRoute> {
        let (route, previous) = {
            let mut routes = self.routes.lock();
            let previous = routes.get(project_id).cloned();
            let subdomain = match &previous {
                Some(existing) => existing.subdomain.clone(),
                None => unique_subdomain(&routes, &base_subdomain(username, project_name)),
            };

            let route = ProxyRoute {
                project_id: project_id.to_string(),
                user_id: user_id.to_string(),
                full_domain: format!("{}.{}", subdomain, self.base_domain),
                subdomain,
                target_port,
                ssl_enabled: self.config.ssl_enabled,
                created_at: Utc::now(),
            };
            routes.insert(project_id.to_string(), route.clone());
            (route, previous)
        };

        let installed = timeout(self.config.operation_timeout(), self.backend.install(&route)).await;
        let failure = match installed {
            Ok(Ok(())) => {
                info!(
                    project_id,
                    domain = %route.full_domain,
                    port = target_port,
                    "Route created"
                );
                return Some(route);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}s", self.config.operation_timeout_secs),
        };

        warn!(project_id, domain = %route.full_domain, error = %failure, "Failed to install route");

        let mut routes = self.routes.lock();
        if routes.get(project_id) == Some(&route) {
            match previous {
                Some(previous) => {
                    routes.insert(project_id.to_string(), previous);
                }
                None => {
                    routes.remove(project_id);
                }
            }
        }
        None
    }

    /// Remove the project's route. False when it had none or the backend
    /// failed; on failure the route stays so the removal can be retried.
    pub async fn remove_route(&self, project_id: &str) -> bool {
        let Some(route) = self.routes.lock().get(project_id).cloned() else {
            debug!(project_id, "No route to remove");
            return false;
        };

        let removed = timeout(
            self.config.operation_timeout(),
            self.backend.remove(&route.full_domain),
        )
        .await;

        match removed {
            Ok(Ok(())) => {
                let mut routes = self.routes.lock();
                if routes
                    .get(project_id)
                    .is_some_and(|r| r.full_domain == route.full_domain)
                {
                    routes.remove(project_id);
                }
                info!(project_id, domain = %route.full_domain, "Route removed");
                true
            }
            Ok(Err(e)) => {
                warn!(project_id, domain = %route.full_domain, error = %e, "Failed to remove route");
                false
            }
            Err(_) => {
                warn!(project_id, domain = %route.full_domain, "Route removal timed out");
                false
            }
        }
    }

    pub fn get_route(&self, project_id: &str) -> Option<ProxyRoute> {
        self.routes.lock().get(project_id).cloned()
    }

    /// All routes, ordered by domain
    pub fn active_routes(&self) -> Vec<ProxyRoute> {
        let mut routes: Vec<_> = self.routes.lock().values().cloned().collect();
        routes.sort_by(|a, b| a.full_domain.cmp(&b.full_domain));
        routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }
}

/// Lowercase DNS-label form of a name: ascii alphanumerics, single dashes
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn base_subdomain(username: &str, project_name: &str) -> String {
    let user = slugify(username);
    let project = slugify(project_name);
    let joined = match (user.is_empty(), project.is_empty()) {
        (false, false) => format!("{}-{}", user, project),
        (false, true) => user,
        (true, false) => project,
        (true, true) => "project".to_string(),
    };
    truncate_label(&joined, MAX_LABEL_LEN)
}

fn truncate_label(label: &str, max: usize) -> String {
    let mut out: String = label.chars().take(max).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// `base`, or `base-2`, `base-3`, ... whichever no route uses yet
fn unique_subdomain(routes: &HashMap<String, ProxyRoute>, base: &str) -> String {
    let taken = |candidate: &str| routes.values().any(|r| r.subdomain == candidate);
    if !taken(base) {
        return base.to_string();
    }

    let mut n = 2u32;
    loop {
        let suffix = format!("-{}", n);
        let candidate = format!("{}{}", truncate_label(base, MAX_LABEL_LEN - suffix.len()), suffix);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Validate and lowercase a domain name
pub fn normalize_domain(domain: &str) -> anyhow::Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();

    if domain.is_empty() {
        anyhow::bail!("Domain cannot be empty");
    }

    if domain.len() > 253 {
        anyhow::bail!("Domain name too long");
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            anyhow::bail!("Domain '{}' has an empty or oversized label", domain);
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!("Domain '{}' contains invalid characters", domain);
        }
        if label.starts_with('-') || label.ends_with('-') {
            anyhow::bail!("Domain label '{}' cannot start or end with '-'", label);
        }
    }

    Ok(domain)
}
