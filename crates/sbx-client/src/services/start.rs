use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{info, instrument, warn};

use sbx_core::error::not_valid;
use sbx_core::sandbox::{Sandbox, SandboxStatus};
use sbx_core::session::{self, EgressPolicy, SessionConfig};
use sbx_core::task::Operation;
use sbx_core::time;
use sbx_engine::Engine;
use sbx_storage::Database;

use super::ledger_step;
use crate::resolve;

/// Session configuration applied by this start.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub env: BTreeMap<String, String>,
    pub egress: Option<EgressPolicy>,
}

/// Boot a sandbox. Startable from `created` and `stopped`; the session env
/// is normalized and persisted before the engine runs so the installed
/// script always matches the record.
#[instrument(skip_all, fields(reference))]
pub async fn start(
    db: &Database,
    engine: &dyn Engine,
    reference: &str,
    opts: StartOptions,
) -> Result<Sandbox> {
    let mut sandbox = resolve::sandbox(db, reference)?;
    if !sandbox.status.is_startable() {
        return Err(not_valid(format!(
            "sandbox {:?} is {}; start requires created or stopped",
            sandbox.name, sandbox.status
        )));
    }

    session::validate_env_keys(opts.env.keys().map(String::as_str))?;

    let sandbox_id = sandbox.id.clone();
    db.add_tasks(
        &sandbox_id,
        Operation::Start,
        &["persist_session", "boot_vm", "mark_running"],
    )?;

    ledger_step(db, &sandbox_id, Operation::Start, async {
        sandbox.session = SessionConfig {
            env: opts.env,
            egress: opts.egress,
        };
        db.update_sandbox(&sandbox)
    })
    .await?;

    let boot = ledger_step(db, &sandbox_id, Operation::Start, engine.start(&sandbox)).await;

    if let Err(e) = boot {
        // Do not leave a half-booted VM behind; the record keeps the error.
        if let Err(stop_err) = engine.stop(&sandbox).await {
            warn!(sandbox_id = %sandbox_id, error = %stop_err, "rollback stop failed");
        }
        sandbox.status = SandboxStatus::Failed;
        sandbox.last_error = Some(format!("{:#}", e));
        db.update_sandbox(&sandbox)?;
        return Err(e);
    }

    ledger_step(db, &sandbox_id, Operation::Start, async {
        sandbox.status = SandboxStatus::Running;
        sandbox.started_at = Some(time::now());
        sandbox.last_error = None;
        db.update_sandbox(&sandbox)
    })
    .await?;

    info!(sandbox_id = %sandbox.id, name = %sandbox.name, "sandbox started");
    Ok(sandbox)
}
