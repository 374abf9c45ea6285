//! SQLite storage for users, projects and project settings
//!
//! Project settings are a JSON document. The only part devgate writes is
//! `containerConfig.ports`; everything else in the document is preserved.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::{PortMap, ProjectConfigStore, ProjectInfo, StoredPorts, UserInfo};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub settings: serde_json::Value,
    pub deleted: bool,
    pub created_at: String,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: users and projects
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL REFERENCES users(id),
                settings TEXT NOT NULL DEFAULT '{}',
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: owner lookups
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: project owner index");

        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id);
            CREATE INDEX IF NOT EXISTS idx_projects_deleted ON projects(deleted);

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    // ==================== Users ====================

    pub fn create_user(&self, id: &str, username: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username) VALUES (?1, ?2)",
            params![id, username],
        )
        .context("Failed to create user")?;
        Ok(())
    }

    pub fn get_user_record(&self, id: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, created_at FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
        .context("Failed to get user")
    }

    // ==================== Projects ====================

    /// Create a project with an empty settings document
    pub fn create_project(&self, id: &str, name: &str, owner_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (id, name, owner_id) VALUES (?1, ?2, ?3)",
            params![id, name, owner_id],
        )
        .context("Failed to create project")?;
        Ok(())
    }

    pub fn get_project_record(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, owner_id, settings, deleted, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to get project")?;

        row.map(|(id, name, owner_id, settings, deleted, created_at)| -> Result<ProjectRecord> {
            let settings = serde_json::from_str(&settings)
                .with_context(|| format!("Corrupt settings for project {}", id))?;
            Ok(ProjectRecord {
                id,
                name,
                owner_id,
                settings,
                deleted,
                created_at,
            })
        })
        .transpose()
    }

    /// Soft-delete a project. Its settings stay in place but are ignored on reload.
    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE projects SET deleted = 1, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Replace a project's whole settings document
    pub fn set_settings(&self, id: &str, settings: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE projects SET settings = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![settings.to_string(), id],
        )?;
        if rows == 0 {
            anyhow::bail!("Project {} does not exist", id);
        }
        Ok(())
    }

    /// Raw settings text, for callers that store documents devgate can't parse
    pub fn set_settings_raw(&self, id: &str, settings: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE projects SET settings = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![settings, id],
        )?;
        Ok(())
    }
}

impl ProjectConfigStore for Database {
    fn get_project(&self, project_id: &str) -> Result<Option<ProjectInfo>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, owner_id, deleted FROM projects WHERE id = ?1",
            params![project_id],
            |row| {
                Ok(ProjectInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    owner_id: row.get(2)?,
                    deleted: row.get(3)?,
                })
            },
        )
        .optional()
        .context("Failed to get project")
    }

    fn get_user(&self, user_id: &str) -> Result<Option<UserInfo>> {
        Ok(self.get_user_record(user_id)?.map(|u| UserInfo {
            id: u.id,
            username: u.username,
        }))
    }

    fn save_ports(&self, project_id: &str, ports: Option<&PortMap>) -> Result<()> {
        // Read-modify-write under one lock so concurrent settings edits don't interleave
        let conn = self.conn.lock();
        let raw: String = conn
            .query_row(
                "SELECT settings FROM projects WHERE id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("Project {} does not exist", project_id))?;

        let mut settings: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt settings for project {}", project_id))?;
        if !settings.is_object() {
            settings = serde_json::json!({});
        }

        let container = settings
            .as_object_mut()
            .and_then(|obj| {
                let entry = obj
                    .entry("containerConfig")
                    .or_insert_with(|| serde_json::json!({}));
                if !entry.is_object() {
                    *entry = serde_json::json!({});
                }
                entry.as_object_mut()
            })
            .ok_or_else(|| anyhow::anyhow!("settings is not an object"))?;

        match ports {
            Some(map) => {
                container.insert("ports".to_string(), serde_json::to_value(map)?);
            }
            None => {
                container.remove("ports");
            }
        }

        conn.execute(
            "UPDATE projects SET settings = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![settings.to_string(), project_id],
        )?;

        debug!(project_id, cleared = ports.is_none(), "Saved port map");
        Ok(())
    }

    fn list_port_maps(&self) -> Result<Vec<StoredPorts>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, settings FROM projects WHERE deleted = 0 ORDER BY created_at, id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut maps = Vec::new();
        for (project_id, project_name, raw) in rows {
            let settings: serde_json::Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "Skipping project with unreadable settings");
                    continue;
                }
            };

            if let Some(ports) = settings.pointer("/containerConfig/ports") {
                maps.push(StoredPorts {
                    project_id,
                    project_name,
                    ports: ports.clone(),
                });
            }
        }

        Ok(maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "alice").unwrap();
        db.create_project("p1", "My App", "u1").unwrap();
        db
    }

    #[test]
    fn test_create_and_get_project() {
        let db = seeded();

        let project = db.get_project("p1").unwrap().unwrap();
        assert_eq!(project.name, "My App");
        assert_eq!(project.owner_id, "u1");
        assert!(!project.deleted);

        let user = db.get_user("u1").unwrap().unwrap();
        assert_eq!(user.username, "alice");

        assert!(db.get_project("missing").unwrap().is_none());
        assert!(db.get_user("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_ports_preserves_other_settings() {
        let db = seeded();
        db.set_settings(
            "p1",
            &serde_json::json!({"theme": "dark", "containerConfig": {"image": "node:20"}}),
        )
        .unwrap();

        let mut ports = PortMap::new();
        ports.insert("frontend".into(), 5200);
        ports.insert("backend".into(), 5210);
        db.save_ports("p1", Some(&ports)).unwrap();

        let record = db.get_project_record("p1").unwrap().unwrap();
        assert_eq!(record.settings["theme"], "dark");
        assert_eq!(record.settings["containerConfig"]["image"], "node:20");
        assert_eq!(record.settings["containerConfig"]["ports"]["backend"], 5210);

        db.save_ports("p1", None).unwrap();
        let record = db.get_project_record("p1").unwrap().unwrap();
        assert!(record.settings["containerConfig"].get("ports").is_none());
        assert_eq!(record.settings["containerConfig"]["image"], "node:20");
    }

    #[test]
    fn test_save_ports_unknown_project_fails() {
        let db = seeded();
        assert!(db.save_ports("nope", Some(&PortMap::new())).is_err());
    }

    #[test]
    fn test_list_port_maps_skips_deleted_and_unreadable() {
        let db = seeded();
        db.create_project("p2", "Other", "u1").unwrap();
        db.create_project("p3", "Broken", "u1").unwrap();
        db.create_project("p4", "No Ports", "u1").unwrap();

        let mut ports = PortMap::new();
        ports.insert("frontend".into(), 5200);
        db.save_ports("p1", Some(&ports)).unwrap();
        db.save_ports("p2", Some(&ports)).unwrap();
        db.set_settings_raw("p3", "{not json").unwrap();
        db.delete_project("p2").unwrap();

        let maps = db.list_port_maps().unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].project_id, "p1");
        assert_eq!(maps[0].project_name, "My App");
        assert_eq!(maps[0].ports["frontend"], 5200);
    }

    #[test]
    fn test_database_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("devgate.db");

        {
            let db = Database::open(&path).unwrap();
            db.create_user("u1", "alice").unwrap();
            db.create_project("p1", "App", "u1").unwrap();
            let mut ports = PortMap::new();
            ports.insert("backend".into(), 5211);
            db.save_ports("p1", Some(&ports)).unwrap();
        }

        let db = Database::open(&path).unwrap();
        let maps = db.list_port_maps().unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].ports["backend"], 5211);
    }
}
