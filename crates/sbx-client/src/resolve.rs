use anyhow::Result;

use sbx_core::error::is_not_found;
use sbx_core::id;
use sbx_core::sandbox::Sandbox;
use sbx_storage::Database;

/// Resolve a user-supplied sandbox reference.
///
/// Lookup by exact name first; when that misses *and* the string is
/// ID-shaped, fall back to lookup by ID. Any other miss surfaces directly.
pub fn sandbox(db: &Database, reference: &str) -> Result<Sandbox> {
    match db.get_sandbox_by_name(reference) {
        Ok(sandbox) => Ok(sandbox),
        Err(e) if is_not_found(&e) && id::looks_like_id(reference) => db.get_sandbox(reference),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::sandbox::{SandboxConfig, SandboxStatus};
    use sbx_core::session::SessionConfig;
    use sbx_core::time;

    fn seed(db: &Database, name: &str) -> Sandbox {
        let sandbox = Sandbox {
            id: id::generate(),
            name: name.to_string(),
            status: SandboxStatus::Created,
            config: SandboxConfig::default(),
            session: SessionConfig::default(),
            internal_ip: None,
            backend_ref: None,
            last_error: None,
            created_at: time::now(),
            started_at: None,
            stopped_at: None,
        };
        db.create_sandbox(&sandbox).unwrap();
        sandbox
    }

    #[test]
    fn test_resolve_by_name() {
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db, "web");
        assert_eq!(sandbox(&db, "web").unwrap().id, seeded.id);
    }

    #[test]
    fn test_resolve_by_id_when_name_misses() {
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db, "web");
        assert_eq!(sandbox(&db, &seeded.id).unwrap().name, "web");
    }

    #[test]
    fn test_name_wins_over_id_shape() {
        // A sandbox literally named like a ULID must resolve by name.
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(
            sandbox(&db, "01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap().id,
            seeded.id
        );
    }

    #[test]
    fn test_non_id_shaped_miss_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = sandbox(&db, "ghost").unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_id_shaped_miss_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = sandbox(&db, "01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap_err();
        assert!(is_not_found(&err));
    }
}
