use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use sbx_core::error::{already_exists, not_found};
use sbx_core::sandbox::{EngineKind, Resources, Sandbox, SandboxConfig, SandboxStatus};
use sbx_core::session::SessionConfig;
use sbx_core::time;

use crate::db::Database;

const SANDBOX_COLUMNS: &str = "id, name, status, engine, rootfs_path, kernel_image_path, \
     vcpus, memory_mb, disk_gb, env, egress, internal_ip, backend_ref, last_error, \
     created_at, started_at, stopped_at";

impl Database {
    /// Persist a new sandbox. The unique name index rejects collisions, so
    /// there is no read-then-write race.
    pub fn create_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let conn = self.lock_conn();
        let env_json = serde_json::to_string(&sandbox.session.env)?;
        let egress_json = sandbox
            .session
            .egress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = conn.execute(
            &format!(
                "INSERT INTO sandboxes ({SANDBOX_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                sandbox.id,
                sandbox.name,
                sandbox.status.as_str(),
                sandbox.config.engine.map(|e| e.as_str()),
                sandbox.config.rootfs_path,
                sandbox.config.kernel_image_path,
                sandbox.config.resources.vcpus,
                sandbox.config.resources.memory_mb,
                sandbox.config.resources.disk_gb,
                env_json,
                egress_json,
                sandbox.internal_ip,
                sandbox.backend_ref,
                sandbox.last_error,
                time::to_epoch(sandbox.created_at),
                sandbox.started_at.map(time::to_epoch),
                sandbox.stopped_at.map(time::to_epoch),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(already_exists(format!(
                "sandbox {:?} already exists",
                sandbox.name
            ))),
            Err(e) => Err(e).context("inserting sandbox"),
        }
    }

    pub fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                &format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?1"),
                params![id],
                read_sandbox_row,
            )
            .optional()?;

        row.ok_or_else(|| not_found(format!("sandbox with id {:?} does not exist", id)))?
    }

    pub fn get_sandbox_by_name(&self, name: &str) -> Result<Sandbox> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                &format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE name = ?1"),
                params![name],
                read_sandbox_row,
            )
            .optional()?;

        row.ok_or_else(|| not_found(format!("sandbox {:?} does not exist", name)))?
    }

    /// All sandboxes, newest first.
    pub fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt
            .query_map([], read_sandbox_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Whole-record replace keyed by ID.
    pub fn update_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let conn = self.lock_conn();
        let env_json = serde_json::to_string(&sandbox.session.env)?;
        let egress_json = sandbox
            .session
            .egress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated = conn.execute(
            "UPDATE sandboxes SET
                name = ?2, status = ?3, engine = ?4, rootfs_path = ?5,
                kernel_image_path = ?6, vcpus = ?7, memory_mb = ?8, disk_gb = ?9,
                env = ?10, egress = ?11, internal_ip = ?12, backend_ref = ?13,
                last_error = ?14, created_at = ?15, started_at = ?16, stopped_at = ?17
             WHERE id = ?1",
            params![
                sandbox.id,
                sandbox.name,
                sandbox.status.as_str(),
                sandbox.config.engine.map(|e| e.as_str()),
                sandbox.config.rootfs_path,
                sandbox.config.kernel_image_path,
                sandbox.config.resources.vcpus,
                sandbox.config.resources.memory_mb,
                sandbox.config.resources.disk_gb,
                env_json,
                egress_json,
                sandbox.internal_ip,
                sandbox.backend_ref,
                sandbox.last_error,
                time::to_epoch(sandbox.created_at),
                sandbox.started_at.map(time::to_epoch),
                sandbox.stopped_at.map(time::to_epoch),
            ],
        )?;

        if updated == 0 {
            return Err(not_found(format!(
                "sandbox with id {:?} does not exist",
                sandbox.id
            )));
        }
        Ok(())
    }

    /// Delete a sandbox record. Task history is kept for post-mortem.
    pub fn delete_sandbox(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM sandboxes WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(not_found(format!(
                "sandbox with id {:?} does not exist",
                id
            )));
        }
        Ok(())
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn read_sandbox_row(row: &Row<'_>) -> rusqlite::Result<Result<Sandbox>> {
    // Collect raw columns first; JSON/enum decoding happens outside the
    // rusqlite error domain.
    let engine_str: Option<String> = row.get(3)?;
    let status_str: String = row.get(2)?;
    let env_json: String = row.get(9)?;
    let egress_json: Option<String> = row.get(10)?;
    let created_at: i64 = row.get(14)?;
    let started_at: Option<i64> = row.get(15)?;
    let stopped_at: Option<i64> = row.get(16)?;

    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let rootfs_path: Option<String> = row.get(4)?;
    let kernel_image_path: Option<String> = row.get(5)?;
    let vcpus: f64 = row.get(6)?;
    let memory_mb: i64 = row.get(7)?;
    let disk_gb: i64 = row.get(8)?;
    let internal_ip: Option<String> = row.get(11)?;
    let backend_ref: Option<String> = row.get(12)?;
    let last_error: Option<String> = row.get(13)?;

    Ok((|| -> Result<Sandbox> {
        Ok(Sandbox {
            id,
            name,
            status: SandboxStatus::parse(&status_str)?,
            config: SandboxConfig {
                engine: engine_str.as_deref().map(EngineKind::parse).transpose()?,
                rootfs_path,
                kernel_image_path,
                resources: Resources {
                    vcpus,
                    memory_mb,
                    disk_gb,
                },
            },
            session: SessionConfig {
                env: serde_json::from_str(&env_json)?,
                egress: egress_json
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
            },
            internal_ip,
            backend_ref,
            last_error,
            created_at: time::from_epoch(created_at),
            started_at: started_at.map(time::from_epoch),
            stopped_at: stopped_at.map(time::from_epoch),
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::error::{is_already_exists, is_not_found};
    use sbx_core::id;

    fn sandbox(name: &str) -> Sandbox {
        Sandbox {
            id: id::generate(),
            name: name.to_string(),
            status: SandboxStatus::Created,
            config: SandboxConfig {
                engine: Some(EngineKind::Fake),
                rootfs_path: None,
                kernel_image_path: None,
                resources: Resources {
                    vcpus: 2.0,
                    memory_mb: 1024,
                    disk_gb: 10,
                },
            },
            session: SessionConfig::default(),
            internal_ip: None,
            backend_ref: None,
            last_error: None,
            created_at: time::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    #[test]
    fn test_create_get_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let sb = sandbox("web");
        db.create_sandbox(&sb).unwrap();

        let by_id = db.get_sandbox(&sb.id).unwrap();
        assert_eq!(by_id.name, "web");
        assert_eq!(by_id.status, SandboxStatus::Created);
        assert_eq!(by_id.config.resources.vcpus, 2.0);
        assert_eq!(by_id.created_at, sb.created_at);

        let by_name = db.get_sandbox_by_name("web").unwrap();
        assert_eq!(by_name.id, sb.id);
    }

    #[test]
    fn test_duplicate_name_is_already_exists() {
        let db = Database::open_in_memory().unwrap();
        db.create_sandbox(&sandbox("dup")).unwrap();
        let err = db.create_sandbox(&sandbox("dup")).unwrap_err();
        assert!(is_already_exists(&err));
    }

    #[test]
    fn test_name_is_reusable_after_delete() {
        let db = Database::open_in_memory().unwrap();
        let sb = sandbox("recycled");
        db.create_sandbox(&sb).unwrap();
        db.delete_sandbox(&sb.id).unwrap();
        db.create_sandbox(&sandbox("recycled")).unwrap();
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(is_not_found(&db.get_sandbox("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap_err()));
        assert!(is_not_found(&db.get_sandbox_by_name("ghost").unwrap_err()));
    }

    #[test]
    fn test_list_orders_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let mut old = sandbox("old");
        old.created_at = time::from_epoch(1_700_000_000);
        let mut new = sandbox("new");
        new.created_at = time::from_epoch(1_800_000_000);
        db.create_sandbox(&old).unwrap();
        db.create_sandbox(&new).unwrap();

        let names: Vec<String> = db
            .list_sandboxes()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn test_update_replaces_whole_record() {
        let db = Database::open_in_memory().unwrap();
        let mut sb = sandbox("mut");
        db.create_sandbox(&sb).unwrap();

        sb.status = SandboxStatus::Running;
        sb.started_at = Some(time::now());
        sb.internal_ip = Some("172.30.0.2".into());
        sb.session.env.insert("KEY".into(), "value".into());
        db.update_sandbox(&sb).unwrap();

        let loaded = db.get_sandbox(&sb.id).unwrap();
        assert_eq!(loaded.status, SandboxStatus::Running);
        assert_eq!(loaded.internal_ip.as_deref(), Some("172.30.0.2"));
        assert_eq!(loaded.session.env.get("KEY").map(String::as_str), Some("value"));
        assert_eq!(loaded.started_at, sb.started_at);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.update_sandbox(&sandbox("ghost")).unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.delete_sandbox("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_full_round_trip_scenario() {
        // Create → GetByName → GetByID → List contains → Delete → NotFound → List omits.
        let db = Database::open_in_memory().unwrap();
        let sb = sandbox("round-trip");
        db.create_sandbox(&sb).unwrap();

        let by_name = db.get_sandbox_by_name("round-trip").unwrap();
        let by_id = db.get_sandbox(&by_name.id).unwrap();
        assert_eq!(by_id.name, "round-trip");
        assert!(db.list_sandboxes().unwrap().iter().any(|s| s.id == sb.id));

        db.delete_sandbox(&sb.id).unwrap();
        assert!(is_not_found(&db.get_sandbox_by_name("round-trip").unwrap_err()));
        assert!(db.list_sandboxes().unwrap().is_empty());
    }
}
