//! The real microVM supervisor: one Firecracker process per sandbox.
//!
//! Durable state stays upstream; everything this engine owns (jail
//! directory, tap device, control socket, VMM process) is derivable from
//! the sandbox ID, so instances are constructed per call and carry no
//! state of their own.

mod api;
mod egress;
mod jail;
mod network;
mod snapshot;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use sbx_core::error::{not_found, not_valid};
use sbx_core::sandbox::{EngineKind, Sandbox, SandboxConfig, SandboxStatus};
use sbx_core::session::SessionConfig;
use sbx_core::time;

use crate::{
    Engine, EngineCheck, EngineStatus, ExecOptions, ExecStatus, PortForward, SnapshotStats,
    session_env,
};

use api::{ActionType, BootSource, Drive, FirecrackerApi, InstanceState, MachineConfig, NetworkInterface};
use jail::JailPaths;
use ssh::SshTarget;

const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Engine-level knobs, fixed by the client at construction time.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    /// Root of all engine-owned state (`<data_dir>/sandboxes/<id>/`).
    pub data_dir: PathBuf,
    /// Explicit VMM binary; overrides auto-resolution.
    pub binary_path: Option<PathBuf>,
    pub ssh_user: String,
    pub ssh_identity: Option<PathBuf>,
    /// Bound on the post-boot SSH handshake wait.
    pub ssh_wait_timeout: Duration,
    pub api_ready_timeout: Duration,
    pub graceful_stop_timeout: Duration,
}

impl FirecrackerConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            binary_path: None,
            ssh_user: "root".to_string(),
            ssh_identity: None,
            ssh_wait_timeout: Duration::from_secs(60),
            api_ready_timeout: Duration::from_secs(5),
            graceful_stop_timeout: Duration::from_secs(5),
        }
    }
}

pub struct FirecrackerEngine {
    config: FirecrackerConfig,
}

impl FirecrackerEngine {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self { config }
    }

    fn jail_paths(&self, sandbox_id: &str) -> JailPaths {
        JailPaths::new(&self.config.data_dir, sandbox_id)
    }

    /// Binary resolution order: explicit path, then a `firecracker` placed
    /// next to the kernel image, then the process search path.
    fn resolve_binary(&self, config: &SandboxConfig) -> Result<PathBuf> {
        if let Some(path) = &self.config.binary_path {
            return Ok(path.clone());
        }
        if let Some(kernel) = &config.kernel_image_path {
            if let Some(dir) = Path::new(kernel).parent() {
                let candidate = dir.join("firecracker");
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        which::which("firecracker").context("firecracker binary not found in PATH")
    }

    fn ssh_target(&self, sandbox: &Sandbox) -> Result<SshTarget> {
        let ip = sandbox
            .internal_ip
            .clone()
            .unwrap_or_else(|| network::net_for_id(&sandbox.id).guest_ip);
        Ok(SshTarget {
            ip,
            user: self.config.ssh_user.clone(),
            identity: self.config.ssh_identity.clone(),
        })
    }

    /// Drive the control API from empty VMM to running guest, then finish
    /// host-side provisioning. Separated so `start` can clean up the
    /// process on any failure.
    async fn boot_and_provision(
        &self,
        sandbox: &Sandbox,
        paths: &JailPaths,
        net: &network::GuestNet,
    ) -> Result<()> {
        let api = FirecrackerApi::new(&paths.api_socket());
        api.wait_ready(self.config.api_ready_timeout).await?;

        let resources = &sandbox.config.resources;
        api.put_machine_config(&MachineConfig {
            vcpu_count: (resources.vcpus.ceil() as u8).max(1),
            mem_size_mib: resources.memory_mb,
            smt: false,
        })
        .await?;

        api.put_boot_source(&BootSource {
            kernel_image_path: paths.kernel().display().to_string(),
            boot_args: Some(format!(
                "{} {}",
                BASE_BOOT_ARGS,
                network::boot_ip_args(net)
            )),
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: paths.rootfs().display().to_string(),
            is_root_device: true,
            is_read_only: false,
        })
        .await?;

        api.put_network_interface(&NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: net.guest_mac.clone(),
            host_dev_name: net.tap_dev.clone(),
        })
        .await?;

        api.action(ActionType::InstanceStart).await?;
        info!(sandbox_id = %sandbox.id, "instance started, waiting for SSH");

        ssh::wait_for_ssh(&net.guest_ip, self.config.ssh_wait_timeout).await?;

        if let Some(policy) = &sandbox.session.egress {
            egress::apply(&sandbox.id, &net.guest_ip, policy).await?;
        }

        session_env::install(self, sandbox).await?;
        Ok(())
    }

    /// Graceful CtrlAltDel with a deadline, then SIGKILL. Safe to call with
    /// no process at all.
    async fn halt_vm(&self, sandbox_id: &str, paths: &JailPaths) {
        let Some(pid) = jail::read_pid(paths).await else {
            jail::clean_runtime_files(paths).await;
            return;
        };

        if jail::is_pid_alive(pid) {
            if paths.api_socket().exists() {
                let api = FirecrackerApi::new(&paths.api_socket());
                if let Err(e) = api.action(ActionType::SendCtrlAltDel).await {
                    warn!(sandbox_id, error = %e, "graceful shutdown request failed");
                }
            }
            if !jail::wait_for_exit(pid, self.config.graceful_stop_timeout).await {
                warn!(sandbox_id, pid, "VM did not exit gracefully, killing");
                jail::kill_hard(pid);
            }
        }
        jail::clean_runtime_files(paths).await;
    }
}

#[async_trait]
impl Engine for FirecrackerEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Firecracker
    }

    async fn check(&self) -> Vec<EngineCheck> {
        let mut checks = Vec::new();

        match self.resolve_binary(&SandboxConfig::default()) {
            Ok(path) => checks.push(EngineCheck::ok(
                "firecracker.binary",
                format!("found {}", path.display()),
            )),
            Err(e) => checks.push(EngineCheck::error("firecracker.binary", e.to_string())),
        }

        if Path::new("/dev/kvm").exists() {
            checks.push(EngineCheck::ok("firecracker.kvm", "/dev/kvm is present"));
        } else {
            checks.push(EngineCheck::error(
                "firecracker.kvm",
                "/dev/kvm is missing; hardware virtualization is unavailable",
            ));
        }

        match which::which("ssh") {
            Ok(_) => checks.push(EngineCheck::ok("firecracker.ssh", "ssh client available")),
            Err(_) => checks.push(EngineCheck::error(
                "firecracker.ssh",
                "ssh client not found in PATH",
            )),
        }

        // Tap and nftables management need root; boot still works for
        // preconfigured devices, so this is only a warning.
        if unsafe { libc::geteuid() } == 0 {
            checks.push(EngineCheck::ok("firecracker.privileges", "running as root"));
        } else {
            checks.push(EngineCheck::warn(
                "firecracker.privileges",
                "not running as root; tap and egress rule management will fail",
            ));
        }

        match tokio::fs::create_dir_all(&self.config.data_dir).await {
            Ok(()) => checks.push(EngineCheck::ok(
                "firecracker.data_dir",
                format!("{} is writable", self.config.data_dir.display()),
            )),
            Err(e) => checks.push(EngineCheck::error(
                "firecracker.data_dir",
                format!("{}: {}", self.config.data_dir.display(), e),
            )),
        }

        checks
    }

    #[instrument(skip_all, fields(id, name))]
    async fn create(&self, id: &str, name: &str, config: &SandboxConfig) -> Result<Sandbox> {
        config.validate()?;
        let rootfs = config
            .rootfs_path
            .as_deref()
            .ok_or_else(|| not_valid("firecracker sandboxes require rootfs_path"))?;
        let kernel = config
            .kernel_image_path
            .as_deref()
            .ok_or_else(|| not_valid("firecracker sandboxes require kernel_image_path"))?;
        if !Path::new(rootfs).exists() {
            return Err(not_valid(format!("rootfs {:?} does not exist", rootfs)));
        }
        if !Path::new(kernel).exists() {
            return Err(not_valid(format!("kernel image {:?} does not exist", kernel)));
        }

        let net = network::net_for_id(id);
        network::setup_tap(&net).await?;

        let paths = self.jail_paths(id);
        jail::prepare(&paths, rootfs, kernel, config.resources.disk_gb).await?;

        info!(id, name, tap = %net.tap_dev, guest_ip = %net.guest_ip, "sandbox backend created");

        Ok(Sandbox {
            id: id.to_string(),
            name: name.to_string(),
            status: SandboxStatus::Created,
            config: config.clone(),
            session: SessionConfig::default(),
            internal_ip: Some(net.guest_ip),
            backend_ref: Some(paths.dir().display().to_string()),
            last_error: None,
            created_at: time::now(),
            started_at: None,
            stopped_at: None,
        })
    }

    #[instrument(skip_all, fields(sandbox_id = %sandbox.id))]
    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        let paths = self.jail_paths(&sandbox.id);
        if !paths.rootfs().exists() {
            return Err(not_found(format!(
                "no backend for sandbox {:?}; was it created with this engine?",
                sandbox.name
            )));
        }

        let net = network::net_for_id(&sandbox.id);
        network::setup_tap(&net).await?;

        let binary = self.resolve_binary(&sandbox.config)?;
        jail::spawn_vmm(&binary, &paths, &sandbox.id).await?;

        if let Err(e) = self.boot_and_provision(sandbox, &paths, &net).await {
            self.halt_vm(&sandbox.id, &paths).await;
            let _ = network::teardown_tap(&net.tap_dev).await;
            return Err(e);
        }

        info!(sandbox_id = %sandbox.id, guest_ip = %net.guest_ip, "sandbox is running");
        Ok(())
    }

    #[instrument(skip_all, fields(sandbox_id = %sandbox.id))]
    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        let paths = self.jail_paths(&sandbox.id);
        self.halt_vm(&sandbox.id, &paths).await;

        let net = network::net_for_id(&sandbox.id);
        network::teardown_tap(&net.tap_dev).await?;
        if sandbox.session.egress.is_some() {
            egress::flush(&sandbox.id).await;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(sandbox_id = %sandbox.id))]
    async fn remove(&self, sandbox: &Sandbox) -> Result<()> {
        let paths = self.jail_paths(&sandbox.id);
        self.halt_vm(&sandbox.id, &paths).await;

        let net = network::net_for_id(&sandbox.id);
        let _ = network::teardown_tap(&net.tap_dev).await;
        egress::flush_quiet(&sandbox.id).await;

        jail::remove(&paths).await
    }

    async fn status(&self, sandbox: &Sandbox) -> Result<EngineStatus> {
        let paths = self.jail_paths(&sandbox.id);
        if !paths.dir().exists() {
            return Err(not_found(format!(
                "no backend for sandbox {:?}",
                sandbox.name
            )));
        }

        let pid = jail::read_pid(&paths).await.filter(|&p| jail::is_pid_alive(p));
        let status = match pid {
            Some(_) => {
                let api = FirecrackerApi::new(&paths.api_socket());
                match api.instance_info().await {
                    Ok(info) if info.state == InstanceState::Running => SandboxStatus::Running,
                    Ok(_) => SandboxStatus::Created,
                    // Process alive but API unreachable: boot is in flight.
                    Err(_) => SandboxStatus::Created,
                }
            }
            None if sandbox.started_at.is_some() => SandboxStatus::Stopped,
            None => SandboxStatus::Created,
        };

        Ok(EngineStatus {
            status,
            internal_ip: sandbox.internal_ip.clone(),
            pid,
        })
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecStatus> {
        if argv.is_empty() {
            return Err(not_valid("exec requires a non-empty argv"));
        }
        let target = self.ssh_target(sandbox)?;
        ssh::exec(&target, argv, opts).await
    }

    async fn copy_to(&self, sandbox: &Sandbox, local: &Path, remote: &str) -> Result<()> {
        let target = self.ssh_target(sandbox)?;
        ssh::copy_to(&target, local, remote).await
    }

    async fn copy_from(&self, sandbox: &Sandbox, remote: &str, local: &Path) -> Result<()> {
        let target = self.ssh_target(sandbox)?;
        ssh::copy_from(&target, remote, local).await
    }

    async fn forward(
        &self,
        sandbox: &Sandbox,
        ports: &[PortForward],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if ports.is_empty() {
            return Err(not_valid("forward requires at least one port"));
        }
        let target = self.ssh_target(sandbox)?;
        ssh::forward(&target, ports, cancel).await
    }

    async fn create_snapshot(
        &self,
        sandbox: &Sandbox,
        snapshot_id: &str,
        dest: &Path,
    ) -> Result<SnapshotStats> {
        let paths = self.jail_paths(&sandbox.id);
        if let Some(pid) = jail::read_pid(&paths).await {
            if jail::is_pid_alive(pid) {
                return Err(not_valid(format!(
                    "sandbox {:?} must be stopped before snapshotting",
                    sandbox.name
                )));
            }
        }
        if !paths.rootfs().exists() {
            return Err(not_found(format!(
                "no backend rootfs for sandbox {:?}",
                sandbox.name
            )));
        }

        info!(sandbox_id = %sandbox.id, snapshot_id, dest = %dest.display(), "creating snapshot");
        snapshot::create(&paths.rootfs(), dest).await
    }
}
