use sbx_engine::{Engine, EngineCheck};
use sbx_storage::Database;

/// Engine diagnostics plus a database probe. Never fails; problems are
/// results with a severity.
pub async fn check(db: &Database, engine: &dyn Engine) -> Vec<EngineCheck> {
    let mut checks = engine.check().await;

    match db.list_sandboxes() {
        Ok(sandboxes) => checks.push(EngineCheck::ok(
            "store.database",
            format!("database reachable, {} sandbox(es)", sandboxes.len()),
        )),
        Err(e) => checks.push(EngineCheck::error(
            "store.database",
            format!("database unreachable: {:#}", e),
        )),
    }

    checks
}
