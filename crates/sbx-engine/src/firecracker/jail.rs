//! Per-VM jail directory and process supervision.
//!
//! Each sandbox owns one directory under `<data_dir>/sandboxes/<id>/` holding
//! its writable rootfs copy, a kernel symlink, the control socket, the VMM
//! log, and the pid file. Everything here is reclaimable from the ID alone.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, warn};

/// Filesystem layout of one jail.
#[derive(Debug, Clone)]
pub struct JailPaths {
    dir: PathBuf,
}

impl JailPaths {
    pub fn new(data_dir: &Path, sandbox_id: &str) -> Self {
        Self {
            dir: data_dir.join("sandboxes").join(sandbox_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs.ext4")
    }

    pub fn kernel(&self) -> PathBuf {
        self.dir.join("vmlinux")
    }

    pub fn api_socket(&self) -> PathBuf {
        self.dir.join("firecracker.socket")
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join("firecracker.log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("fc.pid")
    }
}

/// Lay out the jail for a new sandbox: sparse rootfs copy grown to the
/// configured disk size, plus a kernel symlink.
pub async fn prepare(
    paths: &JailPaths,
    rootfs_src: &str,
    kernel_src: &str,
    disk_gb: i64,
) -> Result<()> {
    tokio::fs::create_dir_all(paths.dir())
        .await
        .with_context(|| format!("creating jail directory {}", paths.dir().display()))?;

    let rootfs = paths.rootfs();
    copy_sparse(Path::new(rootfs_src), &rootfs).await?;

    // Grow the copy so the guest sees the configured disk; truncate extends
    // sparsely and never shrinks below the source size.
    let src_len = tokio::fs::metadata(rootfs_src)
        .await
        .with_context(|| format!("reading rootfs source {}", rootfs_src))?
        .len();
    let want = (disk_gb as u64) << 30;
    if want > src_len {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&rootfs)
            .await?;
        file.set_len(want).await?;
    }

    let kernel = paths.kernel();
    if tokio::fs::symlink_metadata(&kernel).await.is_ok() {
        tokio::fs::remove_file(&kernel).await?;
    }
    tokio::fs::symlink(kernel_src, &kernel)
        .await
        .with_context(|| format!("linking kernel {} into jail", kernel_src))?;

    Ok(())
}

/// Sparse file copy via `cp --sparse=always`; hole-preserving copies are not
/// expressible through the portable fs API.
pub async fn copy_sparse(src: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("cp")
        .arg("--sparse=always")
        .arg(src)
        .arg(dest)
        .output()
        .await
        .context("running cp")?;
    if !output.status.success() {
        bail!(
            "copying {} to {}: {}",
            src.display(),
            dest.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Spawn the Firecracker process detached from the caller, with its output
/// redirected into the jail log. Returns the pid, also written to the pid
/// file for recovery after a crash of this process.
pub async fn spawn_vmm(binary: &Path, paths: &JailPaths, sandbox_id: &str) -> Result<u32> {
    let socket = paths.api_socket();
    if socket.exists() {
        tokio::fs::remove_file(&socket).await.ok();
    }

    let log = std::fs::File::create(paths.log_file())
        .with_context(|| format!("creating {}", paths.log_file().display()))?;
    let log_err = log.try_clone()?;

    let mut command = Command::new(binary);
    command
        .arg("--api-sock")
        .arg(&socket)
        .arg("--id")
        .arg(sandbox_id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0);

    let child = command
        .spawn()
        .with_context(|| format!("spawning firecracker from {}", binary.display()))?;
    let pid = child
        .id()
        .context("firecracker exited before reporting a pid")?;

    tokio::fs::write(paths.pid_file(), pid.to_string()).await?;
    debug!(sandbox_id, pid, "firecracker process started");

    // The VMM outlives this process; the pid file is the handle from here on.
    drop(child);
    Ok(pid)
}

/// Read the recorded VMM pid, if a jail has one.
pub async fn read_pid(paths: &JailPaths) -> Option<u32> {
    let raw = tokio::fs::read_to_string(paths.pid_file()).await.ok()?;
    raw.trim().parse().ok()
}

pub fn is_pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Wait for a process to exit, up to `timeout`.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    !is_pid_alive(pid)
}

/// SIGKILL the VMM. Absent processes are fine.
pub fn kill_hard(pid: u32) {
    unsafe {
        if libc::kill(pid as i32, libc::SIGKILL) != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::ESRCH) {
                warn!(pid, error = %errno, "SIGKILL failed");
            }
        }
    }
}

/// Remove runtime droppings after the VMM has exited.
pub async fn clean_runtime_files(paths: &JailPaths) {
    for path in [paths.api_socket(), paths.pid_file()] {
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// Delete the whole jail tree. Idempotent.
pub async fn remove(paths: &JailPaths) -> Result<()> {
    match tokio::fs::remove_dir_all(paths.dir()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing jail {}", paths.dir().display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jail_paths_layout() {
        let paths = JailPaths::new(Path::new("/var/lib/sbx"), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(
            paths.dir().to_str().unwrap(),
            "/var/lib/sbx/sandboxes/01ARZ3NDEKTSV4RRFFQ69G5FAV"
        );
        assert!(paths.rootfs().ends_with("rootfs.ext4"));
        assert!(paths.api_socket().ends_with("firecracker.socket"));
        assert!(paths.pid_file().ends_with("fc.pid"));
    }

    #[tokio::test]
    async fn test_remove_missing_jail_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let paths = JailPaths::new(dir.path(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        remove(&paths).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_pid_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = JailPaths::new(dir.path(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        tokio::fs::create_dir_all(paths.dir()).await.unwrap();
        assert_eq!(read_pid(&paths).await, None);

        tokio::fs::write(paths.pid_file(), "4242\n").await.unwrap();
        assert_eq!(read_pid(&paths).await, Some(4242));
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }
}
