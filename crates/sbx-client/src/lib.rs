// sbx-client: Lifecycle services and the stable public surface.
//
// A `Client` wraps the database handle, a logger-friendly configuration,
// and the engine-construction policy. Services are instantiated per call
// and borrow the repository and engine only for the duration of one
// operation; nothing is cached between calls except the database handle
// and the fake engine's instance-local state.

pub mod resolve;
pub mod services;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sbx_core::image::ImageRelease;
use sbx_core::sandbox::{EngineKind, Sandbox, SandboxConfig};
use sbx_engine::{
    Engine, EngineCheck, EngineStatus, ExecStatus, FakeEngine, FirecrackerConfig,
    FirecrackerEngine, PortForward,
};
use sbx_storage::Database;

pub use services::copy::{CopyRequest, parse_copy_args};
pub use services::create::CreateOptions;
pub use services::exec::ExecRequest;
pub use services::forward::parse_port_spec;
pub use services::pull::{FetchedImage, HttpImageFetcher, ImageFetcher};
pub use services::snapshot::SnapshotOptions;
pub use services::start::StartOptions;

/// Default image registry consulted by `pull`.
pub const DEFAULT_REGISTRY_URL: &str = "https://images.sbx.dev/v1";

/// Construction-time configuration. Unset fields fall back to the
/// `~/.sbx/` defaults.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub db_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    /// Forces every operation onto one engine, overriding auto-detection.
    pub engine: Option<EngineKind>,
    pub firecracker_binary: Option<PathBuf>,
    pub ssh_user: Option<String>,
    pub ssh_identity: Option<PathBuf>,
    pub registry_url: Option<String>,
}

pub struct Client {
    db: Database,
    data_dir: PathBuf,
    engine_override: Option<EngineKind>,
    firecracker: FirecrackerConfig,
    fake: FakeEngine,
    registry_url: String,
}

/// Engine chosen for one operation. The fake engine is borrowed from the
/// client (its map is instance-local state); Firecracker engines are
/// constructed per call.
enum SelectedEngine<'a> {
    Fake(&'a FakeEngine),
    Firecracker(FirecrackerEngine),
}

impl SelectedEngine<'_> {
    fn as_dyn(&self) -> &dyn Engine {
        match self {
            SelectedEngine::Fake(engine) => *engine,
            SelectedEngine::Firecracker(engine) => engine,
        }
    }
}

impl Client {
    /// Open the client against its on-disk state, creating and migrating
    /// the database as needed.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let data_dir = match config.data_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("cannot determine the home directory; set data_dir explicitly")?
                .join(".sbx"),
        };
        let db_path = config.db_path.unwrap_or_else(|| data_dir.join("sbx.db"));
        let db = Database::open(&db_path)?;

        let mut firecracker = FirecrackerConfig::new(data_dir.clone());
        firecracker.binary_path = config.firecracker_binary;
        if let Some(user) = config.ssh_user {
            firecracker.ssh_user = user;
        }
        firecracker.ssh_identity = config.ssh_identity;

        debug!(data_dir = %data_dir.display(), db = %db_path.display(), "client opened");

        Ok(Self {
            db,
            data_dir,
            engine_override: config.engine,
            firecracker,
            fake: FakeEngine::new(),
            registry_url: config
                .registry_url
                .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Engine auto-detection: explicit client override, then the sandbox
    /// config's engine field, then Firecracker when the config carries
    /// Firecracker fields, else fake.
    fn select_engine(&self, config: &SandboxConfig) -> SelectedEngine<'_> {
        let kind = self
            .engine_override
            .or(config.engine)
            .unwrap_or(if config.has_firecracker_fields() {
                EngineKind::Firecracker
            } else {
                EngineKind::Fake
            });

        match kind {
            EngineKind::Fake => SelectedEngine::Fake(&self.fake),
            EngineKind::Firecracker => {
                SelectedEngine::Firecracker(FirecrackerEngine::new(self.firecracker.clone()))
            }
        }
    }

    fn engine_for(&self, sandbox: &Sandbox) -> SelectedEngine<'_> {
        self.select_engine(&sandbox.config)
    }

    pub async fn create(&self, mut opts: CreateOptions) -> Result<Sandbox> {
        // Resolve a snapshot restore before engine selection so the
        // substituted Firecracker fields participate in auto-detection.
        if let Some(reference) = opts.restore_from.take() {
            let image = self.db.get_image_by_ref(&reference)?;
            opts.config.rootfs_path = Some(image.rootfs_path);
            if opts.config.kernel_image_path.is_none() {
                opts.config.kernel_image_path = image.kernel_image_path;
            }
        }
        let engine = self.select_engine(&opts.config);
        services::create::create(&self.db, engine.as_dyn(), opts).await
    }

    pub async fn start(&self, reference: &str, opts: StartOptions) -> Result<Sandbox> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::start::start(&self.db, engine.as_dyn(), reference, opts).await
    }

    pub async fn stop(&self, reference: &str) -> Result<Sandbox> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::stop::stop(&self.db, engine.as_dyn(), reference).await
    }

    pub async fn remove(&self, reference: &str, force: bool) -> Result<()> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::remove::remove(&self.db, engine.as_dyn(), reference, force).await
    }

    pub async fn exec(&self, reference: &str, request: ExecRequest) -> Result<ExecStatus> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::exec::exec(&self.db, engine.as_dyn(), reference, request).await
    }

    /// Copy with the `sandbox:path` argument grammar.
    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let request = parse_copy_args(src, dst)?;
        let sandbox = resolve::sandbox(&self.db, &request.sandbox_ref)?;
        let engine = self.engine_for(&sandbox);
        services::copy::copy(&self.db, engine.as_dyn(), src, dst).await
    }

    /// Blocks until `cancel` fires; cancellation is the success path.
    pub async fn forward(
        &self,
        reference: &str,
        ports: &[PortForward],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::forward::forward(&self.db, engine.as_dyn(), reference, ports, cancel).await
    }

    pub fn list(&self) -> Result<Vec<Sandbox>> {
        services::list::list(&self.db)
    }

    pub fn get(&self, reference: &str) -> Result<Sandbox> {
        services::list::get(&self.db, reference)
    }

    pub async fn status(&self, reference: &str) -> Result<(Sandbox, Option<EngineStatus>)> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::list::status(&self.db, engine.as_dyn(), reference).await
    }

    pub fn tasks(
        &self,
        reference: &str,
        operation: sbx_core::task::Operation,
    ) -> Result<Vec<sbx_core::task::Task>> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        self.db.list_tasks(&sandbox.id, operation)
    }

    /// Operation of the oldest pending ledger step, if any. Pending rows
    /// after a crash reveal where work was interrupted.
    pub fn pending_operation(
        &self,
        reference: &str,
    ) -> Result<Option<sbx_core::task::Operation>> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        self.db.has_pending_operation(&sandbox.id)
    }

    /// Done/total step counts for one operation.
    pub fn progress(
        &self,
        reference: &str,
        operation: sbx_core::task::Operation,
    ) -> Result<sbx_storage::OperationProgress> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        self.db.progress(&sandbox.id, operation)
    }

    pub async fn snapshot(&self, reference: &str, opts: SnapshotOptions) -> Result<ImageRelease> {
        let sandbox = resolve::sandbox(&self.db, reference)?;
        let engine = self.engine_for(&sandbox);
        services::snapshot::snapshot(&self.db, engine.as_dyn(), &self.images_dir(), reference, opts)
            .await
    }

    pub fn images(&self) -> Result<Vec<ImageRelease>> {
        self.db.list_images()
    }

    pub async fn pull(&self, reference: &str) -> Result<ImageRelease> {
        let fetcher = HttpImageFetcher::new(self.registry_url.clone());
        services::pull::pull(&self.db, &fetcher, &self.images_dir(), reference).await
    }

    /// Pull through a caller-supplied fetcher (tests, alternate registries).
    pub async fn pull_with(
        &self,
        fetcher: &dyn ImageFetcher,
        reference: &str,
    ) -> Result<ImageRelease> {
        services::pull::pull(&self.db, fetcher, &self.images_dir(), reference).await
    }

    pub async fn check(&self) -> Vec<EngineCheck> {
        let engine = self.select_engine(&SandboxConfig::default());
        services::check::check(&self.db, engine.as_dyn()).await
    }

    /// Release the database handle. The client must not be used afterwards,
    /// which consuming `self` enforces.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::error::{is_already_exists, is_not_found};
    use sbx_core::sandbox::{Resources, SandboxStatus};

    fn test_client() -> (Client, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(ClientConfig {
            data_dir: Some(dir.path().to_path_buf()),
            engine: Some(EngineKind::Fake),
            ..ClientConfig::default()
        })
        .unwrap();
        (client, dir)
    }

    fn create_opts(name: &str) -> CreateOptions {
        CreateOptions {
            name: Some(name.to_string()),
            config: SandboxConfig {
                resources: Resources {
                    vcpus: 2.0,
                    memory_mb: 1024,
                    disk_gb: 10,
                },
                ..SandboxConfig::default()
            },
            restore_from: None,
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_fake_engine() {
        let (client, _dir) = test_client();

        let sandbox = client.create(create_opts("lifecycle")).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Created);
        assert_eq!(client.list().unwrap().len(), 1);

        let started = client.start("lifecycle", StartOptions::default()).await.unwrap();
        assert_eq!(started.status, SandboxStatus::Running);
        assert!(started.started_at.is_some());

        let status = client
            .exec(
                "lifecycle",
                ExecRequest {
                    argv: vec!["echo".to_string(), "hello".to_string()],
                    ..ExecRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status.exit_code, 0);

        let stopped = client.stop("lifecycle").await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);

        client.remove("lifecycle", false).await.unwrap();
        assert!(client.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_name_conflict() {
        let (client, _dir) = test_client();
        client.create(create_opts("dup")).await.unwrap();
        let err = client.create(create_opts("dup")).await.unwrap_err();
        assert!(is_already_exists(&err));
    }

    #[tokio::test]
    async fn test_force_remove_running() {
        let (client, _dir) = test_client();
        client.create(create_opts("rm-force")).await.unwrap();
        client.start("rm-force", StartOptions::default()).await.unwrap();

        client.remove("rm-force", true).await.unwrap();
        assert!(is_not_found(&client.get("rm-force").unwrap_err()));
    }

    #[tokio::test]
    async fn test_resolution_by_id() {
        let (client, _dir) = test_client();
        let sandbox = client.create(create_opts("by-id")).await.unwrap();
        assert_eq!(client.get(&sandbox.id).unwrap().name, "by-id");
    }

    #[tokio::test]
    async fn test_status_reports_backend_view() {
        let (client, _dir) = test_client();
        client.create(create_opts("viewed")).await.unwrap();
        client.start("viewed", StartOptions::default()).await.unwrap();

        let (record, view) = client.status("viewed").await.unwrap();
        assert_eq!(record.status, SandboxStatus::Running);
        assert_eq!(view.unwrap().status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn test_snapshot_then_restore_into_new_sandbox() {
        let (client, _dir) = test_client();
        client.create(create_opts("golden")).await.unwrap();
        client.start("golden", StartOptions::default()).await.unwrap();
        client.stop("golden").await.unwrap();

        let image = client
            .snapshot("golden", SnapshotOptions::default())
            .await
            .unwrap();
        assert!(client.images().unwrap().iter().any(|i| i.id == image.id));

        let mut opts = create_opts("from-golden");
        opts.restore_from = Some("golden".to_string());
        let restored = client.create(opts).await.unwrap();
        assert_eq!(
            restored.config.rootfs_path.as_deref(),
            Some(image.rootfs_path.as_str())
        );
    }

    #[tokio::test]
    async fn test_check_reports_fake_engine_and_store() {
        let (client, _dir) = test_client();
        let checks = client.check().await;
        assert!(checks.iter().any(|c| c.id == "fake.backend"));
        assert!(checks.iter().any(|c| c.id == "store.database"));
    }

    #[tokio::test]
    async fn test_ledger_visible_through_tasks() {
        let (client, _dir) = test_client();
        let sandbox = client.create(create_opts("ledgered")).await.unwrap();
        let tasks = client
            .tasks(&sandbox.id, sbx_core::task::Operation::Create)
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].sequence, 1);
    }
}
