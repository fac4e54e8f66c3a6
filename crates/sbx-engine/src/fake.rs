//! In-memory engine for tests and rapid library integration.
//!
//! Honors the whole contract with constant-time success and no I/O of any
//! kind. Its only state is a map `id → {status, started_at, stopped_at}`
//! held inside the engine instance; records it has not seen before are
//! adopted from the durable record handed in, so the backend view survives
//! per-call engine construction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use sbx_core::error::not_valid;
use sbx_core::sandbox::{EngineKind, Sandbox, SandboxConfig, SandboxStatus};
use sbx_core::session::SessionConfig;
use sbx_core::time;

use crate::{
    CheckSeverity, Engine, EngineCheck, EngineStatus, ExecOptions, ExecStatus, PortForward,
    SnapshotStats,
};

#[derive(Debug, Clone, Copy)]
struct FakeVm {
    status: SandboxStatus,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct FakeEngine {
    vms: Mutex<HashMap<String, FakeVm>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_vm<T>(&self, sandbox: &Sandbox, f: impl FnOnce(&mut FakeVm) -> T) -> T {
        let mut vms = match self.vms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let vm = vms.entry(sandbox.id.clone()).or_insert(FakeVm {
            status: sandbox.status,
            started_at: sandbox.started_at,
            stopped_at: sandbox.stopped_at,
        });
        f(vm)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fake
    }

    async fn check(&self) -> Vec<EngineCheck> {
        vec![EngineCheck {
            id: "fake.backend".to_string(),
            severity: CheckSeverity::Ok,
            message: "fake engine is always available".to_string(),
        }]
    }

    async fn create(&self, id: &str, name: &str, config: &SandboxConfig) -> Result<Sandbox> {
        config.validate()?;
        let sandbox = Sandbox {
            id: id.to_string(),
            name: name.to_string(),
            status: SandboxStatus::Created,
            config: config.clone(),
            session: SessionConfig::default(),
            internal_ip: None,
            backend_ref: None,
            last_error: None,
            created_at: time::now(),
            started_at: None,
            stopped_at: None,
        };
        self.with_vm(&sandbox, |_| ());
        Ok(sandbox)
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        self.with_vm(sandbox, |vm| {
            vm.status = SandboxStatus::Running;
            vm.started_at = Some(time::now());
        });
        Ok(())
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        self.with_vm(sandbox, |vm| {
            vm.status = SandboxStatus::Stopped;
            vm.stopped_at = Some(time::now());
        });
        Ok(())
    }

    async fn remove(&self, sandbox: &Sandbox) -> Result<()> {
        let mut vms = match self.vms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        vms.remove(&sandbox.id);
        Ok(())
    }

    async fn status(&self, sandbox: &Sandbox) -> Result<EngineStatus> {
        let (status, _started, _stopped) =
            self.with_vm(sandbox, |vm| (vm.status, vm.started_at, vm.stopped_at));
        Ok(EngineStatus {
            status,
            internal_ip: sandbox.internal_ip.clone(),
            pid: None,
        })
    }

    async fn exec(
        &self,
        _sandbox: &Sandbox,
        argv: &[String],
        _opts: &ExecOptions,
    ) -> Result<ExecStatus> {
        if argv.is_empty() {
            return Err(not_valid("exec requires a non-empty argv"));
        }
        Ok(ExecStatus { exit_code: 0 })
    }

    async fn copy_to(&self, _sandbox: &Sandbox, _local: &Path, _remote: &str) -> Result<()> {
        Ok(())
    }

    async fn copy_from(&self, _sandbox: &Sandbox, _remote: &str, _local: &Path) -> Result<()> {
        Ok(())
    }

    async fn forward(
        &self,
        _sandbox: &Sandbox,
        ports: &[PortForward],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if ports.is_empty() {
            return Err(not_valid("forward requires at least one port"));
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        sandbox: &Sandbox,
        _snapshot_id: &str,
        _dest: &Path,
    ) -> Result<SnapshotStats> {
        let status = self.with_vm(sandbox, |vm| vm.status);
        if status == SandboxStatus::Running {
            return Err(not_valid(format!(
                "sandbox {:?} must be stopped before snapshotting",
                sandbox.name
            )));
        }
        Ok(SnapshotStats {
            virtual_size_bytes: sandbox.config.resources.disk_gb << 30,
            allocated_size_bytes: 0,
        })
    }
}
