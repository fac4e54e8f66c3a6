use anyhow::Result;
use tracing::{info, instrument, warn};

use sbx_core::error::not_valid;
use sbx_core::sandbox::SandboxStatus;
use sbx_core::task::Operation;
use sbx_engine::Engine;
use sbx_storage::Database;

use super::ledger_step;
use crate::resolve;

/// Remove a sandbox. A running sandbox is refused unless `force`, in which
/// case it gets a best-effort stop first; the engine remove and repository
/// delete are idempotent against half-removed backends.
#[instrument(skip_all, fields(reference, force))]
pub async fn remove(db: &Database, engine: &dyn Engine, reference: &str, force: bool) -> Result<()> {
    let sandbox = resolve::sandbox(db, reference)?;
    if sandbox.status == SandboxStatus::Running && !force {
        return Err(not_valid(format!(
            "sandbox {:?} is running; stop it first or pass force",
            sandbox.name
        )));
    }

    db.add_tasks(
        &sandbox.id,
        Operation::Remove,
        &["halt_vm", "remove_backend", "delete_record"],
    )?;

    ledger_step(db, &sandbox.id, Operation::Remove, async {
        if sandbox.status == SandboxStatus::Running {
            if let Err(e) = engine.stop(&sandbox).await {
                warn!(sandbox_id = %sandbox.id, error = %e, "best-effort stop failed");
            }
        }
        Ok(())
    })
    .await?;

    ledger_step(db, &sandbox.id, Operation::Remove, engine.remove(&sandbox)).await?;

    ledger_step(db, &sandbox.id, Operation::Remove, async {
        db.delete_sandbox(&sandbox.id)
    })
    .await?;

    info!(sandbox_id = %sandbox.id, name = %sandbox.name, "sandbox removed");
    Ok(())
}
