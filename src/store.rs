//! Interface to the project configuration store
//!
//! The orchestration core only needs three things from the platform's
//! database: project lookup, user lookup, and a place to persist each
//! project's port map. [`crate::db::Database`] is the production
//! implementation.

use serde::Serialize;
use std::collections::BTreeMap;

/// Persisted port assignment: `frontend`, `backend`, `reserved_1..N`
pub type PortMap = BTreeMap<String, u16>;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
}

/// A project's persisted ports entry, exactly as stored.
///
/// Kept as raw JSON so one malformed project cannot fail a whole reload.
#[derive(Debug, Clone)]
pub struct StoredPorts {
    pub project_id: String,
    pub project_name: String,
    pub ports: serde_json::Value,
}

pub trait ProjectConfigStore: Send + Sync {
    fn get_project(&self, project_id: &str) -> anyhow::Result<Option<ProjectInfo>>;

    fn get_user(&self, user_id: &str) -> anyhow::Result<Option<UserInfo>>;

    /// Write the project's port map, or clear it with `None`
    fn save_ports(&self, project_id: &str, ports: Option<&PortMap>) -> anyhow::Result<()>;

    /// Every non-deleted project that has a persisted ports entry
    fn list_port_maps(&self) -> anyhow::Result<Vec<StoredPorts>>;
}
