use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::not_valid;
use crate::session::SessionConfig;

/// Sandbox lifecycle status. Only the durable states appear here; the
/// Firecracker engine's transient `starting`/`stopping` phases live in
/// memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Created,
    Running,
    Stopped,
    Failed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown sandbox status: {:?}", other),
        }
    }

    /// A sandbox may be started from `created` (fresh) or `stopped` (restart).
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a status transition is allowed.
///
/// Removal is record deletion, not a transition, so it does not appear here.
pub fn validate_transition(from: SandboxStatus, to: SandboxStatus) -> Result<()> {
    // Any state may record a failure.
    if to == SandboxStatus::Failed {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Creation completes
        (SandboxStatus::Pending, SandboxStatus::Created)
        // Fresh start
        | (SandboxStatus::Created, SandboxStatus::Running)
        // Start rollback leaves a bootable-again record
        | (SandboxStatus::Created, SandboxStatus::Stopped)
        // Stop
        | (SandboxStatus::Running, SandboxStatus::Stopped)
        // Restart
        | (SandboxStatus::Stopped, SandboxStatus::Running)
    );

    if valid {
        Ok(())
    } else {
        Err(not_valid(format!(
            "invalid status transition: {} -> {}",
            from, to
        )))
    }
}

/// Which backend runs a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Firecracker,
    Fake,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Firecracker => "firecracker",
            Self::Fake => "fake",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "firecracker" => Ok(Self::Firecracker),
            "fake" => Ok(Self::Fake),
            other => bail!("unknown engine kind: {:?}", other),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute resources granted to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Fractional vCPUs are allowed; the engine rounds up when booting.
    pub vcpus: f64,
    pub memory_mb: i64,
    pub disk_gb: i64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpus: 1.0,
            memory_mb: 512,
            disk_gb: 2,
        }
    }
}

/// Immutable sandbox configuration, fixed at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Explicit engine choice; `None` means auto-detect from the
    /// Firecracker fields below.
    #[serde(default)]
    pub engine: Option<EngineKind>,
    #[serde(default)]
    pub rootfs_path: Option<String>,
    #[serde(default)]
    pub kernel_image_path: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

impl SandboxConfig {
    /// True when the config carries the Firecracker-specific fields.
    pub fn has_firecracker_fields(&self) -> bool {
        self.rootfs_path.is_some() || self.kernel_image_path.is_some()
    }

    /// Validate the configuration for the engine it will run on.
    pub fn validate(&self) -> Result<()> {
        if self.resources.vcpus <= 0.0 {
            return Err(not_valid(format!(
                "vcpus must be positive, got {}",
                self.resources.vcpus
            )));
        }
        if self.resources.memory_mb <= 0 {
            return Err(not_valid(format!(
                "memory_mb must be positive, got {}",
                self.resources.memory_mb
            )));
        }
        if self.resources.disk_gb <= 0 {
            return Err(not_valid(format!(
                "disk_gb must be positive, got {}",
                self.resources.disk_gb
            )));
        }
        if self.engine == Some(EngineKind::Firecracker)
            && (self.rootfs_path.is_none() || self.kernel_image_path.is_none())
        {
            return Err(not_valid(
                "firecracker sandboxes require rootfs_path and kernel_image_path",
            ));
        }
        Ok(())
    }
}

/// The primary durable entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// 26-character ULID, immutable after creation.
    pub id: String,
    /// User-chosen name, globally unique among existing sandboxes.
    pub name: String,
    pub status: SandboxStatus,
    pub config: SandboxConfig,
    /// Mutated only by start.
    #[serde(default)]
    pub session: SessionConfig,
    /// Guest IP assigned by the engine at create time.
    pub internal_ip: Option<String>,
    /// Engine-specific backend reference (e.g. the jail directory).
    pub backend_ref: Option<String>,
    /// Last operation error recorded against this sandbox.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}
