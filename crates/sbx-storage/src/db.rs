use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

/// Handle to the on-disk database. The process holds exclusive ownership of
/// the file; WAL mode serializes writers and allows concurrent readers, so a
/// single mutex-guarded connection is sufficient.
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and migrate the schema
    /// forward. Downgrade is not supported.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        apply_schema_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests and throwaway clients.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        apply_schema_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn apply_schema_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let version = get_schema_version(conn)?;
    debug!(version, "database schema version");

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sandboxes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                engine TEXT,
                rootfs_path TEXT,
                kernel_image_path TEXT,
                vcpus REAL NOT NULL,
                memory_mb INTEGER NOT NULL,
                disk_gb INTEGER NOT NULL,
                env TEXT NOT NULL DEFAULT '{}',
                egress TEXT,
                internal_ip TEXT,
                backend_ref TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                stopped_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                sandbox_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(sandbox_id, operation, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_sandbox_op
                ON tasks(sandbox_id, operation, sequence);",
        )?;
        set_schema_version(conn, 1)?;
    }

    if version < 2 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                rootfs_path TEXT NOT NULL,
                kernel_image_path TEXT,
                source_sandbox_id TEXT,
                virtual_size_bytes INTEGER,
                allocated_size_bytes INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE(name, version)
            );",
        )?;
        set_schema_version(conn, 2)?;
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i64> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}
