//! SQLite persistence for sites, settings, and the activity log
//!
//! Stores the site definitions the reconciler works from, the key-value
//! settings (including the Caddy admin API URL), and an append-only
//! activity log for auditing.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Well-known settings key holding the Caddy admin API base URL
pub const CADDY_API_URL_KEY: &str = "caddy_api_url";

/// A stored site definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub id: String,
    pub name: String,
    pub domain: String,
    /// `reverse_proxy` or `static`
    pub site_type: String,
    /// Type-specific configuration, JSON-encoded
    pub config: String,
    pub enabled: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A key-value setting row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingRecord {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: String,
}

/// One append-only activity log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<String>,
    /// Free-form details payload, JSON-encoded
    pub details: String,
    pub performed_by: String,
    pub performed_at: String,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
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

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

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
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Users (audit attribution)
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'admin',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Managed sites
            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                domain TEXT NOT NULL UNIQUE,
                site_type TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (created_by) REFERENCES users(id)
            );

            -- Key-value settings (caddy_api_url lives here)
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                description TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Append-only activity log
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                entity TEXT NOT NULL,
                entity_id TEXT,
                details TEXT NOT NULL DEFAULT '{}',
                performed_by TEXT NOT NULL,
                performed_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (performed_by) REFERENCES users(id)
            );

            CREATE INDEX IF NOT EXISTS idx_activity_entity
                ON activity_log(entity, entity_id);
        "#,
        )?;

        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (1)",
            [],
        )?;

        Ok(())
    }

    // ==================== User Operations ====================

    /// Insert a user if it does not exist yet. Used for the configured
    /// system account at startup.
    pub fn ensure_user(&self, id: &str, email: &str, name: &str, role: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO users (id, email, name, role) VALUES (?1, ?2, ?3, ?4)",
            params![id, email, name, role],
        )?;
        Ok(())
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ==================== Site Operations ====================

    /// Insert a new site record
    pub fn create_site(&self, site: &SiteRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sites (id, name, domain, site_type, config, enabled, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                site.id,
                site.name,
                site.domain,
                site.site_type,
                site.config,
                site.enabled,
                site.created_by
            ],
        )
        .context("Failed to create site")?;
        Ok(())
    }

    pub fn get_site(&self, id: &str) -> Result<Option<SiteRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, domain, site_type, config, enabled, created_by, created_at, updated_at
             FROM sites WHERE id = ?1",
            params![id],
            row_to_site,
        )
        .optional()
        .context("Failed to get site")
    }

    pub fn get_site_by_domain(&self, domain: &str) -> Result<Option<SiteRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, domain, site_type, config, enabled, created_by, created_at, updated_at
             FROM sites WHERE domain = ?1",
            params![domain],
            row_to_site,
        )
        .optional()
        .context("Failed to get site by domain")
    }

    /// List all sites, newest first
    pub fn list_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, domain, site_type, config, enabled, created_by, created_at, updated_at
             FROM sites ORDER BY created_at DESC, id",
        )?;

        let sites = stmt
            .query_map([], row_to_site)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    /// Update mutable site fields (type is immutable after creation)
    pub fn update_site(&self, id: &str, name: &str, domain: &str, config: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sites SET name = ?1, domain = ?2, config = ?3, updated_at = datetime('now')
             WHERE id = ?4",
            params![name, domain, config, id],
        )
        .context("Failed to update site")?;
        Ok(())
    }

    pub fn set_site_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sites SET enabled = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(())
    }

    pub fn delete_site(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM sites WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Settings Operations ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get setting")
    }

    pub fn set_setting(&self, key: &str, value: &str, description: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value, description, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                description = COALESCE(excluded.description, settings.description),
                updated_at = datetime('now')",
            params![key, value, description],
        )?;
        Ok(())
    }

    pub fn list_settings(&self) -> Result<Vec<SettingRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, value, description, updated_at FROM settings ORDER BY key",
        )?;

        let settings = stmt
            .query_map([], |row| {
                Ok(SettingRecord {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    description: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(settings)
    }

    // ==================== Activity Log Operations ====================

    /// Append an activity log entry
    pub fn append_activity(
        &self,
        action: &str,
        entity: &str,
        entity_id: Option<&str>,
        details: &Value,
        performed_by: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_log (action, entity, entity_id, details, performed_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, entity, entity_id, details.to_string(), performed_by],
        )
        .context("Failed to append activity")?;
        Ok(())
    }

    /// Most recent activity entries, newest first
    pub fn list_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, action, entity, entity_id, details, performed_by, performed_at
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;

        let entries = stmt
            .query_map(params![limit as i64], row_to_activity)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Recent activity for one entity (optionally one entity id)
    pub fn list_activity_for(
        &self,
        entity: &str,
        entity_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, action, entity, entity_id, details, performed_by, performed_at
             FROM activity_log
             WHERE entity = ?1 AND (?2 IS NULL OR entity_id = ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;

        let entries = stmt
            .query_map(params![entity, entity_id, limit as i64], row_to_activity)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

fn row_to_site(row: &rusqlite::Row<'_>) -> rusqlite::Result<SiteRecord> {
    Ok(SiteRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        site_type: row.get(3)?,
        config: row.get(4)?,
        enabled: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRecord> {
    Ok(ActivityRecord {
        id: row.get(0)?,
        action: row.get(1)?,
        entity: row.get(2)?,
        entity_id: row.get(3)?,
        details: row.get(4)?,
        performed_by: row.get(5)?,
        performed_at: row.get(6)?,
    })
}
