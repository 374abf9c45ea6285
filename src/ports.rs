//! Port allocation for project dev servers
//!
//! Every project gets a frontend port, a backend port and a handful of
//! reserved ports. Assignments are packed into fixed-width windows starting
//! at `base_port`, persisted into the project's settings, and reloaded at
//! startup so a restart never hands out a port twice.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::store::{PortMap, ProjectConfigStore};

/// Lowest port a project may be assigned
pub const MIN_PORT: u32 = 1024;
/// Highest port a project may be assigned
pub const MAX_PORT: u32 = 65535;

/// How a project's ports are laid out inside its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// frontend = start, backend = start+1, reserved = the rest of the block
    #[serde(rename = "block", alias = "block-based", alias = "block_based")]
    BlockBased,
    /// frontend = start, backend = start+offset, reserved in between,
    /// the remainder of the window left as headroom
    #[default]
    #[serde(rename = "spaced")]
    Spaced,
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStrategy::BlockBased => write!(f, "block"),
            AllocationStrategy::Spaced => write!(f, "spaced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortAllocation {
    pub project_id: String,
    pub project_name: String,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub reserved_ports: Vec<u16>,
    pub strategy: AllocationStrategy,
    pub allocated_at: DateTime<Utc>,
}

impl PortAllocation {
    /// Every port this allocation holds
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        [self.frontend_port, self.backend_port]
            .into_iter()
            .chain(self.reserved_ports.iter().copied())
    }

    pub fn to_port_map(&self) -> PortMap {
        let mut map = PortMap::new();
        map.insert("frontend".to_string(), self.frontend_port);
        map.insert("backend".to_string(), self.backend_port);
        for (i, port) in self.reserved_ports.iter().enumerate() {
            map.insert(format!("reserved_{}", i + 1), *port);
        }
        map
    }
}

/// Availability of one candidate port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortAvailability {
    pub port: u32,
    pub available: bool,
}

/// Ports parsed from a persisted map, before they become an allocation
#[derive(Debug, PartialEq, Eq)]
struct ParsedPorts {
    frontend: u16,
    backend: u16,
    reserved: Vec<u16>,
}

/// Parse `{frontend, backend, reserved_1..N}`. Reserved keys are ordered by
/// their numeric suffix; unknown keys are ignored.
fn parse_port_map(value: &serde_json::Value) -> std::result::Result<ParsedPorts, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "ports entry is not an object".to_string())?;

    let read = |key: &str, v: &serde_json::Value| -> std::result::Result<u16, String> {
        let n = v
            .as_u64()
            .ok_or_else(|| format!("'{}' is not a port number", key))?;
        if !(MIN_PORT as u64..=MAX_PORT as u64).contains(&n) {
            return Err(format!("'{}' = {} is out of range", key, n));
        }
        Ok(n as u16)
    };

    let frontend = obj
        .get("frontend")
        .ok_or_else(|| "missing 'frontend'".to_string())
        .and_then(|v| read("frontend", v))?;
    let backend = obj
        .get("backend")
        .ok_or_else(|| "missing 'backend'".to_string())
        .and_then(|v| read("backend", v))?;

    let mut reserved: Vec<(u32, u16)> = Vec::new();
    for (key, v) in obj {
        if let Some(index) = key.strip_prefix("reserved_") {
            let index: u32 = index
                .parse()
                .map_err(|_| format!("bad reserved key '{}'", key))?;
            reserved.push((index, read(key, v)?));
        }
    }
    reserved.sort_by_key(|(index, _)| *index);

    Ok(ParsedPorts {
        frontend,
        backend,
        reserved: reserved.into_iter().map(|(_, port)| port).collect(),
    })
}

#[derive(Default)]
struct AllocatorState {
    allocations: HashMap<String, PortAllocation>,
    /// Reverse index: port -> owning project
    owners: HashMap<u16, String>,
}

impl AllocatorState {
    fn insert(&mut self, allocation: PortAllocation) {
        for port in allocation.ports() {
            self.owners.insert(port, allocation.project_id.clone());
        }
        self.allocations
            .insert(allocation.project_id.clone(), allocation);
    }

    fn remove(&mut self, project_id: &str) -> Option<PortAllocation> {
        let allocation = self.allocations.remove(project_id)?;
        for port in allocation.ports() {
            self.owners.remove(&port);
        }
        Some(allocation)
    }

    fn owner(&self, port: u32) -> Option<&str> {
        u16::try_from(port)
            .ok()
            .and_then(|p| self.owners.get(&p))
            .map(String::as_str)
    }

    fn window_free(&self, start: u32, width: u32) -> bool {
        (start..start + width).all(|port| self.owner(port).is_none())
    }
}

/// Assigns non-overlapping port sets to projects
pub struct PortAllocator {
    store: Arc<dyn ProjectConfigStore>,
    config: PortConfig,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Create an empty allocator. Call [`PortAllocator::load_existing`]
    /// before serving requests, or use [`PortAllocator::open`].
    pub fn new(store: Arc<dyn ProjectConfigStore>, config: PortConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Create an allocator and reload persisted assignments
    pub fn open(store: Arc<dyn ProjectConfigStore>, config: PortConfig) -> anyhow::Result<Arc<Self>> {
        let allocator = Self::new(store, config);
        allocator.load_existing()?;
        Ok(Arc::new(allocator))
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Allocate ports for a project, or return its existing allocation
    pub fn allocate(
        &self,
        project_id: &str,
        project_name: &str,
        strategy: AllocationStrategy,
    ) -> Result<PortAllocation> {
        let mut state = self.state.lock();

        if let Some(existing) = state.allocations.get(project_id) {
            return Ok(existing.clone());
        }

        let width = match strategy {
            AllocationStrategy::BlockBased => self.config.block_size,
            AllocationStrategy::Spaced => self.config.space_size,
        } as u32;
        let base = self.config.base_port as u32;
        let limit = base.saturating_add(self.config.search_limit).min(MAX_PORT + 1);

        let mut start = base;
        let window = loop {
            if start + width > limit {
                warn!(
                    project_id,
                    %strategy,
                    base_port = base,
                    "No free port window left"
                );
                return Err(Error::NoCapacity {
                    base_port: self.config.base_port,
                    searched: limit - base,
                });
            }
            if state.window_free(start, width) {
                break start;
            }
            start += width;
        };

        // The window fits below 65536, so every port in it converts to u16
        let (backend, reserved): (u32, Vec<u32>) = match strategy {
            AllocationStrategy::BlockBased => (window + 1, (window + 2..window + width).collect()),
            AllocationStrategy::Spaced => {
                let offset = self.config.spaced_backend_offset as u32;
                (window + offset, (window + 1..window + offset).collect())
            }
        };

        let allocation = PortAllocation {
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            frontend_port: window as u16,
            backend_port: backend as u16,
            reserved_ports: reserved.into_iter().map(|p| p as u16).collect(),
            strategy,
            allocated_at: Utc::now(),
        };

        self.persist(project_id, Some(&allocation.to_port_map()))?;
        state.insert(allocation.clone());

        info!(
            project_id,
            frontend = allocation.frontend_port,
            backend = allocation.backend_port,
            %strategy,
            "Allocated ports"
        );
        Ok(allocation)
    }

    /// Reserve caller-chosen ports for a project. Either every port is
    /// reserved or none is. Ports the project already holds count as free;
    /// its previous allocation is replaced.
    pub fn reserve_explicit(
        &self,
        project_id: &str,
        project_name: &str,
        frontend: u32,
        backend: u32,
        reserved: &[u32],
    ) -> Result<PortAllocation> {
        let requested: Vec<u32> = [frontend, backend]
            .into_iter()
            .chain(reserved.iter().copied())
            .collect();

        if let Some(&bad) = requested
            .iter()
            .find(|&&p| !(MIN_PORT..=MAX_PORT).contains(&p))
        {
            return Err(Error::InvalidPort(bad));
        }

        let mut seen = HashSet::new();
        for &port in &requested {
            if !seen.insert(port) {
                return Err(Error::PortConflict(format!(
                    "port {} requested more than once",
                    port
                )));
            }
        }

        let mut state = self.state.lock();

        for &port in &requested {
            if let Some(owner) = state.owner(port) {
                if owner != project_id {
                    return Err(Error::PortConflict(format!(
                        "port {} is already allocated",
                        port
                    )));
                }
            }
        }

        let allocation = PortAllocation {
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            frontend_port: frontend as u16,
            backend_port: backend as u16,
            reserved_ports: reserved.iter().map(|&p| p as u16).collect(),
            strategy: AllocationStrategy::BlockBased,
            allocated_at: Utc::now(),
        };

        self.persist(project_id, Some(&allocation.to_port_map()))?;
        state.remove(project_id);
        state.insert(allocation.clone());

        info!(
            project_id,
            frontend = allocation.frontend_port,
            backend = allocation.backend_port,
            reserved = allocation.reserved_ports.len(),
            "Reserved explicit ports"
        );
        Ok(allocation)
    }

    /// True iff the port is in range and no project holds it
    pub fn is_available(&self, port: u32) -> bool {
        (MIN_PORT..=MAX_PORT).contains(&port) && self.state.lock().owner(port).is_none()
    }

    pub fn check_ports(&self, ports: &[u32]) -> Vec<PortAvailability> {
        let state = self.state.lock();
        ports
            .iter()
            .map(|&port| PortAvailability {
                port,
                available: (MIN_PORT..=MAX_PORT).contains(&port) && state.owner(port).is_none(),
            })
            .collect()
    }

    pub fn get(&self, project_id: &str) -> Option<PortAllocation> {
        self.state.lock().allocations.get(project_id).cloned()
    }

    /// All allocations, ordered by frontend port
    pub fn list(&self) -> Vec<PortAllocation> {
        let mut all: Vec<_> = self.state.lock().allocations.values().cloned().collect();
        all.sort_by_key(|a| a.frontend_port);
        all
    }

    /// Drop a project's allocation and clear its persisted ports.
    /// Returns false when the project had none.
    pub fn release(&self, project_id: &str) -> Result<bool> {
        let mut state = self.state.lock();

        if !state.allocations.contains_key(project_id) {
            return Ok(false);
        }

        self.persist(project_id, None)?;
        state.remove(project_id);

        info!(project_id, "Released ports");
        Ok(true)
    }

    /// Rebuild the in-memory map from persisted project settings.
    ///
    /// Projects whose map is malformed or overlaps an already-loaded project
    /// are logged and skipped. Returns how many allocations were loaded.
    pub fn load_existing(&self) -> anyhow::Result<usize> {
        let stored = self.store.list_port_maps()?;
        let mut fresh = AllocatorState::default();

        for entry in stored {
            let parsed = match parse_port_map(&entry.ports) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(project_id = %entry.project_id, error = %e, "Skipping malformed port map");
                    continue;
                }
            };

            let allocation = PortAllocation {
                strategy: self.infer_strategy(&parsed),
                project_id: entry.project_id,
                project_name: entry.project_name,
                frontend_port: parsed.frontend,
                backend_port: parsed.backend,
                reserved_ports: parsed.reserved,
                allocated_at: Utc::now(),
            };

            let mut seen = HashSet::new();
            if !allocation.ports().all(|p| seen.insert(p)) {
                warn!(project_id = %allocation.project_id, "Skipping port map with repeated ports");
                continue;
            }

            if let Some(clash) = allocation.ports().find(|p| fresh.owners.contains_key(p)) {
                warn!(
                    project_id = %allocation.project_id,
                    port = clash,
                    owner = %fresh.owners[&clash],
                    "Skipping port map that overlaps another project"
                );
                continue;
            }

            debug!(
                project_id = %allocation.project_id,
                frontend = allocation.frontend_port,
                backend = allocation.backend_port,
                "Loaded port allocation"
            );
            fresh.insert(allocation);
        }

        let count = fresh.allocations.len();
        *self.state.lock() = fresh;

        info!(count, "Loaded existing port allocations");
        Ok(count)
    }

    /// Only a map laid out exactly like a spaced window reloads as spaced:
    /// frontend on a window boundary, backend at the offset and the ports
    /// in between reserved. Explicit reservations reload as block-based.
    fn infer_strategy(&self, parsed: &ParsedPorts) -> AllocationStrategy {
        let base = self.config.base_port as u32;
        let width = self.config.space_size as u32;
        let offset = self.config.spaced_backend_offset as u32;
        let frontend = parsed.frontend as u32;

        let on_boundary = frontend >= base && (frontend - base) % width == 0;
        let backend_at_offset = parsed.backend as u32 == frontend + offset;
        let reserved_between = parsed
            .reserved
            .iter()
            .map(|&p| p as u32)
            .eq(frontend + 1..frontend + offset);

        if on_boundary && backend_at_offset && reserved_between {
            AllocationStrategy::Spaced
        } else {
            AllocationStrategy::BlockBased
        }
    }

    fn persist(&self, project_id: &str, ports: Option<&PortMap>) -> Result<()> {
        self.store.save_ports(project_id, ports).map_err(|e| {
            warn!(project_id, error = %e, "Failed to persist port map");
            Error::Persistence(e.to_string())
        })
    }
}
