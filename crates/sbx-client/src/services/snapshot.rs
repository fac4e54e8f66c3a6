use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, instrument};

use sbx_core::error::not_valid;
use sbx_core::image::ImageRelease;
use sbx_core::sandbox::SandboxStatus;
use sbx_core::task::Operation;
use sbx_core::{id, time};
use sbx_engine::Engine;
use sbx_storage::Database;

use super::ledger_step;
use crate::resolve;

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Catalog name; defaults to the sandbox name.
    pub name: Option<String>,
    /// Catalog version; defaults to the creation epoch.
    pub version: Option<String>,
    /// Destination file; defaults to `<images_dir>/<name>/<version>/rootfs.ext4`.
    pub dest: Option<PathBuf>,
}

/// Snapshot a stopped sandbox's rootfs and register the artifact in the
/// image catalog.
#[instrument(skip_all, fields(reference))]
pub async fn snapshot(
    db: &Database,
    engine: &dyn Engine,
    images_dir: &Path,
    reference: &str,
    opts: SnapshotOptions,
) -> Result<ImageRelease> {
    let sandbox = resolve::sandbox(db, reference)?;
    if sandbox.status != SandboxStatus::Stopped {
        return Err(not_valid(format!(
            "sandbox {:?} is {}; snapshot requires stopped",
            sandbox.name, sandbox.status
        )));
    }

    let snapshot_id = id::generate();
    let created_at = time::now();
    let name = opts.name.unwrap_or_else(|| sandbox.name.clone());
    let version = opts
        .version
        .unwrap_or_else(|| time::to_epoch(created_at).to_string());
    let dest = opts.dest.unwrap_or_else(|| {
        images_dir.join(&name).join(&version).join("rootfs.ext4")
    });

    db.add_tasks(
        &sandbox.id,
        Operation::Snapshot,
        &["copy_rootfs", "register_image"],
    )?;

    let stats = ledger_step(
        db,
        &sandbox.id,
        Operation::Snapshot,
        engine.create_snapshot(&sandbox, &snapshot_id, &dest),
    )
    .await?;

    let image = ImageRelease {
        id: snapshot_id,
        name,
        version,
        rootfs_path: dest.display().to_string(),
        kernel_image_path: sandbox.config.kernel_image_path.clone(),
        source_sandbox_id: Some(sandbox.id.clone()),
        virtual_size_bytes: Some(stats.virtual_size_bytes),
        allocated_size_bytes: Some(stats.allocated_size_bytes),
        created_at,
    };

    ledger_step(db, &sandbox.id, Operation::Snapshot, async {
        db.register_image(&image)
    })
    .await?;

    info!(
        sandbox_id = %sandbox.id,
        image = %format!("{}:{}", image.name, image.version),
        "snapshot registered"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::create::{CreateOptions, create};
    use crate::services::start::{StartOptions, start};
    use crate::services::stop::stop;
    use sbx_core::error::is_not_valid;
    use sbx_core::sandbox::{EngineKind, SandboxConfig};
    use sbx_engine::FakeEngine;

    async fn stopped(db: &Database, engine: &FakeEngine, name: &str) {
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
        stop(db, engine, name).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_registers_catalog_entry() {
        let db = Database::open_in_memory().unwrap();
        let engine = FakeEngine::new();
        let dir = tempfile::tempdir().unwrap();
        stopped(&db, &engine, "frozen").await;

        let image = snapshot(
            &db,
            &engine,
            dir.path(),
            "frozen",
            SnapshotOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(image.name, "frozen");
        assert!(image.source_sandbox_id.is_some());

        let loaded = db.get_image_by_ref("frozen").unwrap();
        assert_eq!(loaded.id, image.id);
    }

    #[tokio::test]
    async fn test_snapshot_requires_stopped() {
        let db = Database::open_in_memory().unwrap();
        let engine = FakeEngine::new();
        let dir = tempfile::tempdir().unwrap();
        create(
            &db,
            &engine,
            CreateOptions {
                name: Some("fresh".to_string()),
                config: SandboxConfig {
                    engine: Some(EngineKind::Fake),
                    ..SandboxConfig::default()
                },
                restore_from: None,
            },
        )
        .await
        .unwrap();

        let err = snapshot(&db, &engine, dir.path(), "fresh", SnapshotOptions::default())
            .await
            .unwrap_err();
        assert!(is_not_valid(&err));
    }

    #[tokio::test]
    async fn test_snapshot_custom_name_and_version() {
        let db = Database::open_in_memory().unwrap();
        let engine = FakeEngine::new();
        let dir = tempfile::tempdir().unwrap();
        stopped(&db, &engine, "base-box").await;

        let image = snapshot(
            &db,
            &engine,
            dir.path(),
            "base-box",
            SnapshotOptions {
                name: Some("golden".to_string()),
                version: Some("v1".to_string()),
                dest: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(image.version, "v1");
        assert_eq!(db.get_image_by_ref("golden:v1").unwrap().id, image.id);
    }
}
