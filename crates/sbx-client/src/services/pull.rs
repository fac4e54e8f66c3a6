use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, instrument};

use sbx_core::error::{is_not_found, already_exists};
use sbx_core::image::{ImageRelease, split_image_ref};
use sbx_core::{id, time};
use sbx_storage::Database;

/// Files a fetch produced on local disk.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub rootfs_path: PathBuf,
    pub kernel_image_path: Option<PathBuf>,
}

/// The registry downloader contract. The downloader itself is an external
/// collaborator; only this seam is fixed.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, name: &str, version: &str, dest_dir: &Path) -> Result<FetchedImage>;
}

/// HTTP registry layout: `<base>/<name>/<version>/rootfs.ext4` plus an
/// optional `vmlinux` next to it.
pub struct HttpImageFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn download(&self, url: &str, dest: &Path, required: bool) -> Result<bool> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetching {}", url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND && !required {
            return Ok(false);
        }
        if !response.status().is_success() {
            bail!("fetching {} returned {}", url, response.status());
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {}", url))?;
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("writing {}", dest.display()))?;
        Ok(true)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, name: &str, version: &str, dest_dir: &Path) -> Result<FetchedImage> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("creating {}", dest_dir.display()))?;

        let rootfs = dest_dir.join("rootfs.ext4");
        self.download(
            &format!("{}/{}/{}/rootfs.ext4", self.base_url, name, version),
            &rootfs,
            true,
        )
        .await?;

        let kernel = dest_dir.join("vmlinux");
        let has_kernel = self
            .download(
                &format!("{}/{}/{}/vmlinux", self.base_url, name, version),
                &kernel,
                false,
            )
            .await?;

        Ok(FetchedImage {
            rootfs_path: rootfs,
            kernel_image_path: has_kernel.then_some(kernel),
        })
    }
}

/// Pull an image release into the local catalog. `name` or `name:version`;
/// the version defaults to `latest`.
#[instrument(skip_all, fields(reference))]
pub async fn pull(
    db: &Database,
    fetcher: &dyn ImageFetcher,
    images_dir: &Path,
    reference: &str,
) -> Result<ImageRelease> {
    let (name, version) = split_image_ref(reference);
    let version = version.unwrap_or("latest");

    match db.get_image_by_ref(&format!("{}:{}", name, version)) {
        Ok(existing) => {
            return Err(already_exists(format!(
                "image {}:{} is already in the catalog (id {})",
                name, version, existing.id
            )));
        }
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e),
    }

    let dest_dir = images_dir.join(name).join(version);
    let fetched = fetcher.fetch(name, version, &dest_dir).await?;

    let virtual_size = tokio::fs::metadata(&fetched.rootfs_path)
        .await
        .map(|m| m.len() as i64)
        .ok();

    let image = ImageRelease {
        id: id::generate(),
        name: name.to_string(),
        version: version.to_string(),
        rootfs_path: fetched.rootfs_path.display().to_string(),
        kernel_image_path: fetched
            .kernel_image_path
            .map(|p| p.display().to_string()),
        source_sandbox_id: None,
        virtual_size_bytes: virtual_size,
        allocated_size_bytes: None,
        created_at: time::now(),
    };
    db.register_image(&image)?;

    info!(image = %format!("{}:{}", image.name, image.version), "image pulled");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::error::is_already_exists;

    /// Test fetcher that materializes files without any network.
    struct StubFetcher {
        with_kernel: bool,
    }

    #[async_trait]
    impl ImageFetcher for StubFetcher {
        async fn fetch(&self, _name: &str, _version: &str, dest_dir: &Path) -> Result<FetchedImage> {
            tokio::fs::create_dir_all(dest_dir).await?;
            let rootfs = dest_dir.join("rootfs.ext4");
            tokio::fs::write(&rootfs, b"rootfs-bytes").await?;
            let kernel = if self.with_kernel {
                let path = dest_dir.join("vmlinux");
                tokio::fs::write(&path, b"kernel-bytes").await?;
                Some(path)
            } else {
                None
            };
            Ok(FetchedImage {
                rootfs_path: rootfs,
                kernel_image_path: kernel,
            })
        }
    }

    #[tokio::test]
    async fn test_pull_registers_release() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher { with_kernel: true };

        let image = pull(&db, &fetcher, dir.path(), "alpine:3.20").await.unwrap();
        assert_eq!(image.name, "alpine");
        assert_eq!(image.version, "3.20");
        assert_eq!(image.virtual_size_bytes, Some(12));
        assert!(image.kernel_image_path.is_some());

        assert_eq!(db.get_image_by_ref("alpine:3.20").unwrap().id, image.id);
    }

    #[tokio::test]
    async fn test_pull_unversioned_defaults_to_latest() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher { with_kernel: false };

        let image = pull(&db, &fetcher, dir.path(), "alpine").await.unwrap();
        assert_eq!(image.version, "latest");
        assert!(image.kernel_image_path.is_none());
    }

    #[tokio::test]
    async fn test_pull_twice_is_already_exists() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StubFetcher { with_kernel: false };

        pull(&db, &fetcher, dir.path(), "alpine:3.20").await.unwrap();
        let err = pull(&db, &fetcher, dir.path(), "alpine:3.20").await.unwrap_err();
        assert!(is_already_exists(&err));
    }
}
