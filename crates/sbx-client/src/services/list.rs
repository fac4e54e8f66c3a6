use anyhow::Result;

use sbx_core::sandbox::Sandbox;
use sbx_engine::{Engine, EngineStatus};
use sbx_storage::Database;

use crate::resolve;

/// All sandboxes, newest first. Repository-only.
pub fn list(db: &Database) -> Result<Vec<Sandbox>> {
    db.list_sandboxes()
}

/// One sandbox by name or ID. Repository-only.
pub fn get(db: &Database, reference: &str) -> Result<Sandbox> {
    resolve::sandbox(db, reference)
}

/// The durable record plus the backend's live view, when the backend still
/// answers for it.
pub async fn status(
    db: &Database,
    engine: &dyn Engine,
    reference: &str,
) -> Result<(Sandbox, Option<EngineStatus>)> {
    let sandbox = resolve::sandbox(db, reference)?;
    let view = engine.status(&sandbox).await.ok();
    Ok((sandbox, view))
}
