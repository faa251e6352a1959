//! SQLite route store
//!
//! Persists proxy routes (one row per domain) and the deployment history.
//! Every route mutation runs inside a single transaction.

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    /// Set on the handle given to a bounded `call`
    deadline: Option<CallDeadline>,
}

#[derive(Debug, Clone, Copy)]
struct CallDeadline {
    at: Instant,
    limit: Duration,
}

impl CallDeadline {
    fn expired(&self) -> anyhow::Error {
        anyhow::anyhow!("Database call timed out after {:?}", self.limit)
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        // WAL keeps readers off the writer's back
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            deadline: None,
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
            deadline: None,
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

    /// Migration v1: proxy routes
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: proxy routes");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_routes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_name TEXT NOT NULL UNIQUE,
                container_id TEXT NOT NULL,
                container_ip TEXT NOT NULL,
                container_port INTEGER NOT NULL CHECK (container_port BETWEEN 1 AND 65535),
                protocol TEXT NOT NULL CHECK (protocol IN ('http', 'https')),
                path TEXT NOT NULL DEFAULT '/',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: deployment history
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: deployment history");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                image_name TEXT NOT NULL,
                image_id TEXT,
                container_id TEXT,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_domain ON deployments(domain);

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    /// Run a blocking store call on the blocking pool, bounded by `limit`
    ///
    /// The bound is enforced inside the closure: waiting for the connection
    /// gives up at the deadline, and a transaction that reaches its commit
    /// after the deadline is rolled back. An error from this call therefore
    /// always means nothing was written.
    pub async fn call<T, F>(&self, limit: Duration, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Self {
            conn: Arc::clone(&self.conn),
            deadline: Some(CallDeadline {
                at: Instant::now() + limit,
                limit,
            }),
        };
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("Database task panicked")?
    }

    /// Take the connection, giving up at the call deadline if there is one
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        match self.deadline {
            None => Ok(self.conn.lock()),
            Some(deadline) => self
                .conn
                .try_lock_until(deadline.at)
                .ok_or_else(|| deadline.expired()),
        }
    }

    fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline.at => Err(deadline.expired()),
            _ => Ok(()),
        }
    }

    // ==================== Route Operations ====================

    /// Insert a route, or update the existing row for the same domain
    pub fn upsert_route(&self, route: &NewRoute) -> Result<RouteWrite> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, container_ip FROM proxy_routes WHERE domain_name = ?1",
                params![route.domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let write = match existing {
            Some((id, previous_ip)) => {
                tx.execute(
                    "UPDATE proxy_routes SET
                        container_id = ?1,
                        container_ip = ?2,
                        container_port = ?3,
                        protocol = ?4,
                        path = ?5,
                        updated_at = datetime('now')
                     WHERE id = ?6",
                    params![
                        route.container_id,
                        route.container_ip,
                        route.container_port,
                        route.protocol.as_str(),
                        route.path,
                        id
                    ],
                )
                .with_context(|| format!("Failed to update route for {}", route.domain))?;
                RouteWrite::Updated { id, previous_ip }
            }
            None => {
                tx.execute(
                    "INSERT INTO proxy_routes
                        (domain_name, container_id, container_ip, container_port, protocol, path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        route.domain,
                        route.container_id,
                        route.container_ip,
                        route.container_port,
                        route.protocol.as_str(),
                        route.path
                    ],
                )
                .with_context(|| format!("Failed to insert route for {}", route.domain))?;
                RouteWrite::Inserted {
                    id: tx.last_insert_rowid(),
                }
            }
        };

        // Dropping the transaction rolls it back
        self.check_deadline()
            .with_context(|| format!("Route write for {} abandoned", route.domain))?;
        tx.commit()?;
        Ok(write)
    }

    pub fn get_route(&self, domain: &str) -> Result<Option<RouteRecord>> {
        let conn = self.lock()?;
        let route = conn
            .query_row(
                "SELECT id, domain_name, container_id, container_ip, container_port, protocol, path, created_at, updated_at
                 FROM proxy_routes WHERE domain_name = ?1",
                params![domain],
                route_from_row,
            )
            .optional()?;
        Ok(route)
    }

    pub fn list_routes(&self) -> Result<Vec<RouteRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, domain_name, container_id, container_ip, container_port, protocol, path, created_at, updated_at
             FROM proxy_routes ORDER BY domain_name",
        )?;

        let routes = stmt
            .query_map([], route_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(routes)
    }

    pub fn delete_route(&self, domain: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM proxy_routes WHERE domain_name = ?1",
            params![domain],
        )?;
        Ok(rows > 0)
    }

    // ==================== Deployment History ====================

    pub fn record_deployment(&self, deployment: &DeploymentRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO deployments (id, domain, image_name, image_id, container_id, status, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                deployment.id,
                deployment.domain,
                deployment.image_name,
                deployment.image_id,
                deployment.container_id,
                deployment.status,
                deployment.message
            ],
        )?;
        Ok(())
    }

    /// Most recent deployments first, optionally for one domain
    pub fn get_deployments(&self, domain: Option<&str>, limit: usize) -> Result<Vec<DeploymentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, domain, image_name, image_id, container_id, status, message, created_at
             FROM deployments
             WHERE ?1 IS NULL OR domain = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let deployments = stmt
            .query_map(params![domain, limit as i64], |row| {
                Ok(DeploymentRecord {
                    id: row.get(0)?,
                    domain: row.get(1)?,
                    image_name: row.get(2)?,
                    image_id: row.get(3)?,
                    container_id: row.get(4)?,
                    status: row.get(5)?,
                    message: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(deployments)
    }
}

fn route_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RouteRecord> {
    Ok(RouteRecord {
        id: row.get(0)?,
        domain_name: row.get(1)?,
        container_id: row.get(2)?,
        container_ip: row.get(3)?,
        container_port: row.get(4)?,
        protocol: row.get(5)?,
        path: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ==================== Record Types ====================

/// Scheme the proxy uses when serving a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => anyhow::bail!("Unknown protocol '{}'", other),
        }
    }
}

/// Route values written by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoute {
    /// Bare domain, no scheme
    pub domain: String,
    pub container_id: String,
    pub container_ip: String,
    pub container_port: u16,
    pub protocol: Protocol,
    pub path: String,
}

/// What an upsert did to the route table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RouteWrite {
    Inserted { id: i64 },
    Updated { id: i64, previous_ip: String },
}

impl RouteWrite {
    pub fn id(&self) -> i64 {
        match self {
            RouteWrite::Inserted { id } | RouteWrite::Updated { id, .. } => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, RouteWrite::Inserted { .. })
    }
}

/// Route record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: i64,
    pub domain_name: String,
    pub container_id: String,
    pub container_ip: String,
    pub container_port: u16,
    pub protocol: String,
    pub path: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Deployment record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub domain: String,
    pub image_name: String,
    pub image_id: Option<String>,
    pub container_id: Option<String>,
    /// `succeeded` or `failed`
    pub status: String,
    pub message: String,
    pub created_at: String,
}
