use anyhow::Result;
use tracing::{info, instrument};

use sbx_core::error::not_valid;
use sbx_core::sandbox::{Sandbox, SandboxStatus};
use sbx_core::task::Operation;
use sbx_core::time;
use sbx_engine::Engine;
use sbx_storage::Database;

use super::ledger_step;
use crate::resolve;

/// Stop a running sandbox. If the repository update fails after the engine
/// has stopped, the operation surfaces as failed even though the backend is
/// clean; the failed `mark_stopped` ledger row records why.
#[instrument(skip_all, fields(reference))]
pub async fn stop(db: &Database, engine: &dyn Engine, reference: &str) -> Result<Sandbox> {
    let mut sandbox = resolve::sandbox(db, reference)?;
    if sandbox.status != SandboxStatus::Running {
        return Err(not_valid(format!(
            "sandbox {:?} is {}; stop requires running",
            sandbox.name, sandbox.status
        )));
    }

    let sandbox_id = sandbox.id.clone();
    db.add_tasks(&sandbox_id, Operation::Stop, &["halt_vm", "mark_stopped"])?;

    ledger_step(db, &sandbox_id, Operation::Stop, engine.stop(&sandbox)).await?;

    ledger_step(db, &sandbox_id, Operation::Stop, async {
        sandbox.status = SandboxStatus::Stopped;
        sandbox.stopped_at = Some(time::now());
        db.update_sandbox(&sandbox)
    })
    .await?;

    info!(sandbox_id = %sandbox.id, name = %sandbox.name, "sandbox stopped");
    Ok(sandbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::create::{CreateOptions, create};
    use crate::services::start::{StartOptions, start};
    use sbx_core::error::is_not_valid;
    use sbx_core::sandbox::{EngineKind, SandboxConfig};
    use sbx_engine::FakeEngine;

    async fn running(db: &Database, engine: &FakeEngine, name: &str) {
        create(
            db,
            engine,
            CreateOptions {
                name: Some(name.to_string()),
                config: SandboxConfig {
                    engine: Some(EngineKind::Fake),
                    ..SandboxConfig::default()
                },
                restore_from: None,
            },
        )
        .await
        .unwrap();
        start(db, engine, name, StartOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_marks_stopped_with_timestamp() {
        let db = Database::open_in_memory().unwrap();
        let engine = FakeEngine::new();
        running(&db, &engine, "web").await;

        let stopped = stop(&db, &engine, "web").await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        let stopped_at = stopped.stopped_at.unwrap();
        assert!(stopped.started_at.unwrap() <= stopped_at);
        assert!(stopped.created_at <= stopped_at);
    }

    #[tokio::test]
    async fn test_stop_requires_running() {
        let db = Database::open_in_memory().unwrap();
        let engine = FakeEngine::new();
        create(
            &db,
            &engine,
            CreateOptions {
                name: Some("cold".to_string()),
                config: SandboxConfig {
                    engine: Some(EngineKind::Fake),
                    ..SandboxConfig::default()
                },
                restore_from: None,
            },
        )
        .await
        .unwrap();

        let err = stop(&db, &engine, "cold").await.unwrap_err();
        assert!(is_not_valid(&err));
    }

    #[tokio::test]
    async fn test_double_stop_is_not_valid() {
        let db = Database::open_in_memory().unwrap();
        let engine = FakeEngine::new();
        running(&db, &engine, "twice").await;
        stop(&db, &engine, "twice").await.unwrap();
        let err = stop(&db, &engine, "twice").await.unwrap_err();
        assert!(is_not_valid(&err));
    }
}
