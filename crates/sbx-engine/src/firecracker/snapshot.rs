//! Rootfs snapshots of stopped sandboxes.
//!
//! A snapshot is a sparse copy of the jail rootfs; the report distinguishes
//! the virtual size (what the guest sees) from the blocks actually
//! allocated on the host.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::SnapshotStats;

use super::jail;

/// Copy `rootfs` to `dest` preserving holes and report both sizes.
pub async fn create(rootfs: &Path, dest: &Path) -> Result<SnapshotStats> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
    }

    jail::copy_sparse(rootfs, dest).await?;

    let stats = probe(dest).await?;
    info!(
        dest = %dest.display(),
        virtual_bytes = stats.virtual_size_bytes,
        allocated_bytes = stats.allocated_size_bytes,
        "snapshot written"
    );
    Ok(stats)
}

/// Sizes of an existing image file.
pub async fn probe(path: &Path) -> Result<SnapshotStats> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    Ok(SnapshotStats {
        virtual_size_bytes: meta.len() as i64,
        // st_blocks counts 512-byte units regardless of filesystem block size.
        allocated_size_bytes: meta.blocks() as i64 * 512,
    })
}
