// sbx-engine: The engine contract and its backends.
//
// An engine supervises the ephemeral side of a sandbox (VM process, tap
// device, jail directory); durable state stays in the repository. Engines
// are cheap to construct and carry no cross-call state, with the fake
// engine's in-memory map as the deliberate exception.

pub mod fake;
pub mod firecracker;
pub mod session_env;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sbx_core::sandbox::{EngineKind, Sandbox, SandboxConfig, SandboxStatus};

pub use fake::FakeEngine;
pub use firecracker::{FirecrackerConfig, FirecrackerEngine};

/// Severity of a single environment check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSeverity {
    Ok,
    Warn,
    Error,
}

impl std::fmt::Display for CheckSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One result from [`Engine::check`].
#[derive(Debug, Clone)]
pub struct EngineCheck {
    pub id: String,
    pub severity: CheckSeverity,
    pub message: String,
}

impl EngineCheck {
    pub fn ok(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            severity: CheckSeverity::Ok,
            message: message.into(),
        }
    }

    pub fn warn(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            severity: CheckSeverity::Warn,
            message: message.into(),
        }
    }

    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            severity: CheckSeverity::Error,
            message: message.into(),
        }
    }
}

/// Options for [`Engine::exec`]. Standard streams are inherited from the
/// calling process.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Allocate a pseudo-terminal in the guest.
    pub tty: bool,
}

/// Outcome of an exec. A non-zero exit code is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: i32,
}

/// One host→guest port mapping for [`Engine::forward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub bind_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Sizes reported by [`Engine::create_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub virtual_size_bytes: i64,
    pub allocated_size_bytes: i64,
}

/// The sandbox as the backend sees it.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub status: SandboxStatus,
    pub internal_ip: Option<String>,
    pub pid: Option<u32>,
}

/// The lifecycle contract every backend implements.
///
/// Methods cancel when their future is dropped; `forward` is the only
/// indefinitely-blocking operation and resolves `Ok` when its token fires.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Environment diagnostics. Never fails; problems are results.
    async fn check(&self) -> Vec<EngineCheck>;

    /// Allocate backend resources for a new sandbox and return the initial
    /// record (status `created`). Never boots anything.
    async fn create(&self, id: &str, name: &str, config: &SandboxConfig) -> Result<Sandbox>;

    /// Boot the backend and bring it to a reachable state, including the
    /// session environment installation. On failure the engine cleans up
    /// its own process before surfacing the first error.
    async fn start(&self, sandbox: &Sandbox) -> Result<()>;

    /// Graceful shutdown, forced after a timeout. Idempotent.
    async fn stop(&self, sandbox: &Sandbox) -> Result<()>;

    /// Release every backend resource. Idempotent on absent resources.
    async fn remove(&self, sandbox: &Sandbox) -> Result<()>;

    /// Backend view of the sandbox.
    async fn status(&self, sandbox: &Sandbox) -> Result<EngineStatus>;

    /// Run a command in the guest and return its exit code verbatim.
    async fn exec(
        &self,
        sandbox: &Sandbox,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecStatus>;

    async fn copy_to(&self, sandbox: &Sandbox, local: &Path, remote: &str) -> Result<()>;

    async fn copy_from(&self, sandbox: &Sandbox, remote: &str, local: &Path) -> Result<()>;

    /// Expose guest ports on the host until `cancel` fires. Cancellation is
    /// the success path.
    async fn forward(
        &self,
        sandbox: &Sandbox,
        ports: &[PortForward],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Copy the rootfs of a stopped sandbox to `dest` as a sparse file and
    /// report its sizes.
    async fn create_snapshot(
        &self,
        sandbox: &Sandbox,
        snapshot_id: &str,
        dest: &Path,
    ) -> Result<SnapshotStats>;
}
