use anyhow::Result;
use tracing::{info, instrument};

use sbx_core::error::{already_exists, is_not_found};
use sbx_core::sandbox::{Sandbox, SandboxConfig};
use sbx_core::{id, naming};
use sbx_core::task::Operation;
use sbx_engine::Engine;
use sbx_storage::Database;

use super::ledger_step;

/// Options for creating a sandbox: a parsed config plus an optional
/// snapshot restore. Config-file loading stays in the CLI.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Auto-generated when absent.
    pub name: Option<String>,
    pub config: SandboxConfig,
    /// Catalog image reference (`name` or `name:version`) whose rootfs
    /// becomes the base of the new sandbox.
    pub restore_from: Option<String>,
}

fn generated_name() -> String {
    names::Generator::default()
        .next()
        .unwrap_or_else(|| format!("sandbox-{}", id::generate().to_lowercase()))
}

/// Create a durable sandbox record and its backend resources. Never boots.
#[instrument(skip_all, fields(name = opts.name.as_deref().unwrap_or("<auto>")))]
pub async fn create(db: &Database, engine: &dyn Engine, opts: CreateOptions) -> Result<Sandbox> {
    let mut config = opts.config;
    if let Some(reference) = &opts.restore_from {
        let image = db.get_image_by_ref(reference)?;
        config.rootfs_path = Some(image.rootfs_path);
        if config.kernel_image_path.is_none() {
            config.kernel_image_path = image.kernel_image_path;
        }
    }

    let name = opts.name.unwrap_or_else(generated_name);
    naming::validate_name(&name)?;

    // Fail fast on a taken name; the unique index still backstops races.
    match db.get_sandbox_by_name(&name) {
        Ok(_) => return Err(already_exists(format!("sandbox {:?} already exists", name))),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e),
    }

    let sandbox_id = id::generate();
    db.add_tasks(
        &sandbox_id,
        Operation::Create,
        &["validate_config", "prepare_backend", "persist_record"],
    )?;

    ledger_step(db, &sandbox_id, Operation::Create, async {
        config.validate()
    })
    .await?;

    let sandbox = ledger_step(
        db,
        &sandbox_id,
        Operation::Create,
        engine.create(&sandbox_id, &name, &config),
    )
    .await?;

    ledger_step(db, &sandbox_id, Operation::Create, async {
        db.create_sandbox(&sandbox)
    })
    .await?;

    info!(id = %sandbox.id, name = %sandbox.name, engine = %engine.kind(), "sandbox created");
    Ok(sandbox)
}
