//! SSH plumbing for exec, copy, and port forwarding.
//!
//! The engine drives the system `ssh`/`scp` binaries rather than speaking
//! the protocol itself; SSH is an external collaborator and only its
//! interface is fixed here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sbx_core::retry;

use crate::{ExecOptions, ExecStatus, PortForward};

pub const SSH_PORT: u16 = 22;

/// Connection parameters for one guest.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub ip: String,
    pub user: String,
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }
}

/// Wait for the guest's SSH port to accept a TCP handshake, with exponential
/// backoff bounded by `timeout`.
pub async fn wait_for_ssh(ip: &str, timeout: Duration) -> Result<()> {
    let addr = format!("{}:{}", ip, SSH_PORT);
    retry::with_backoff("ssh handshake", timeout, Duration::from_millis(100), || {
        let addr = addr.clone();
        async move {
            tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&addr))
                .await
                .with_context(|| format!("connecting to {}", addr))?
                .with_context(|| format!("connecting to {}", addr))?;
            Ok(())
        }
    })
    .await?;
    info!(addr = %addr, "guest SSH is reachable");
    Ok(())
}

/// Quote one argv word for the remote shell.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r#"'"'"'"#))
}

/// Build the remote command line: `cd` + env prefix + quoted argv.
fn remote_command(argv: &[String], opts: &ExecOptions) -> String {
    let mut parts = Vec::new();
    if let Some(cwd) = &opts.cwd {
        parts.push(format!("cd {} &&", shell_quote(cwd)));
    }
    if !opts.env.is_empty() {
        parts.push("env".to_string());
        for (key, value) in &opts.env {
            parts.push(format!("{}={}", key, shell_quote(value)));
        }
    }
    for word in argv {
        parts.push(shell_quote(word));
    }
    parts.join(" ")
}

/// Run a command in the guest with the caller's stdio attached. Returns the
/// remote exit code verbatim.
pub async fn exec(target: &SshTarget, argv: &[String], opts: &ExecOptions) -> Result<ExecStatus> {
    let mut command = Command::new("ssh");
    command.args(target.base_args());
    if opts.tty {
        command.arg("-tt");
    }
    command.arg(target.destination());
    command.arg(remote_command(argv, opts));
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let status = command
        .status()
        .await
        .with_context(|| format!("running ssh to {}", target.ip))?;

    Ok(ExecStatus {
        exit_code: status.code().unwrap_or(-1),
    })
}

/// Run a command in the guest, capturing output. Non-zero exit is an error
/// here; this is for the engine's own provisioning steps.
pub async fn exec_checked(target: &SshTarget, command_line: &str) -> Result<()> {
    let output = Command::new("ssh")
        .args(target.base_args())
        .arg(target.destination())
        .arg(command_line)
        .output()
        .await
        .with_context(|| format!("running ssh to {}", target.ip))?;

    if !output.status.success() {
        bail!(
            "remote command {:?} failed (exit {}): {}",
            command_line,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Upload a file over the secure file-transfer subsystem.
pub async fn copy_to(target: &SshTarget, local: &Path, remote: &str) -> Result<()> {
    scp(
        target,
        &local.display().to_string(),
        &format!("{}:{}", target.destination(), remote),
    )
    .await
}

/// Download a file over the secure file-transfer subsystem.
pub async fn copy_from(target: &SshTarget, remote: &str, local: &Path) -> Result<()> {
    scp(
        target,
        &format!("{}:{}", target.destination(), remote),
        &local.display().to_string(),
    )
    .await
}

async fn scp(target: &SshTarget, from: &str, to: &str) -> Result<()> {
    let output = Command::new("scp")
        .args(target.base_args())
        .arg("-q")
        .arg(from)
        .arg(to)
        .output()
        .await
        .context("running scp")?;

    if !output.status.success() {
        bail!(
            "scp {} -> {} failed: {}",
            from,
            to,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Serve one forwarded connection through its own `ssh -W` channel.
async fn forward_connection(target: SshTarget, mut local: TcpStream, remote_port: u16) {
    let mut child = match Command::new("ssh")
        .args(target.base_args())
        .arg("-W")
        .arg(format!("{}:{}", target.ip, remote_port))
        .arg(target.destination())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "failed to open forward channel");
            return;
        }
    };

    let mut to_guest = child.stdin.take().expect("piped stdin");
    let mut from_guest = child.stdout.take().expect("piped stdout");
    let (mut read_half, mut write_half) = local.split();

    // Bytes flow verbatim both ways until either side closes.
    let result = tokio::select! {
        r = tokio::io::copy(&mut read_half, &mut to_guest) => r,
        r = tokio::io::copy(&mut from_guest, &mut write_half) => r,
    };
    if let Err(e) = result {
        debug!(error = %e, "forward channel closed with error");
    }
    let _ = child.kill().await;
}

/// Listen on each `{bind_addr, local_port}` and tunnel every accepted
/// connection to `{remote_port}` in the guest. Blocks until `cancel` fires,
/// which is the success path.
pub async fn forward(
    target: &SshTarget,
    ports: &[PortForward],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut listeners = Vec::with_capacity(ports.len());
    for port in ports {
        let addr = format!("{}:{}", port.bind_addr, port.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding forward listener on {}", addr))?;
        info!(local = %addr, remote_port = port.remote_port, "forwarding");
        listeners.push((listener, port.remote_port));
    }

    let mut accept_loops = Vec::new();
    for (listener, remote_port) in listeners {
        let target = target.clone();
        let cancel = cancel.clone();
        accept_loops.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, remote_port, "accepted connection");
                                let target = target.clone();
                                tokio::spawn(forward_connection(target, stream, remote_port));
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    cancel.cancelled().await;
    for handle in accept_loops {
        handle.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            ip: "172.30.0.2".to_string(),
            user: "root".to_string(),
            identity: Some(PathBuf::from("/home/dev/.sbx/id_ed25519")),
        }
    }

    #[test]
    fn test_base_args_include_identity() {
        let args = target().base_args();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/home/dev/.sbx/id_ed25519".to_string()));
    }

    #[test]
    fn test_base_args_without_identity() {
        let mut t = target();
        t.identity = None;
        assert!(!t.base_args().contains(&"-i".to_string()));
    }

    #[test]
    fn test_remote_command_plain() {
        let cmd = remote_command(
            &["echo".to_string(), "hello".to_string()],
            &ExecOptions::default(),
        );
        assert_eq!(cmd, "'echo' 'hello'");
    }

    #[test]
    fn test_remote_command_with_cwd_and_env() {
        let mut opts = ExecOptions {
            cwd: Some("/workspace".to_string()),
            ..ExecOptions::default()
        };
        opts.env.insert("FOO".to_string(), "a b".to_string());
        let cmd = remote_command(&["make".to_string()], &opts);
        assert_eq!(cmd, "cd '/workspace' && env FOO='a b' 'make'");
    }

    #[test]
    fn test_remote_command_quotes_single_quotes() {
        let cmd = remote_command(&["echo".to_string(), "it's".to_string()], &ExecOptions::default());
        assert_eq!(cmd, r#"'echo' 'it'"'"'s'"#);
    }

    #[tokio::test]
    async fn test_wait_for_ssh_times_out_on_unroutable_host() {
        // TEST-NET-1 is guaranteed unroutable.
        let err = wait_for_ssh("192.0.2.1", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not succeed within"));
    }

    #[tokio::test]
    async fn test_forward_returns_ok_on_cancel() {
        let cancel = CancellationToken::new();
        let ports = vec![PortForward {
            bind_addr: "127.0.0.1".to_string(),
            local_port: 0,
            remote_port: 80,
        }];
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        forward(&target(), &ports, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_surfaces_bind_collisions() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let ports = vec![PortForward {
            bind_addr: "127.0.0.1".to_string(),
            local_port: port,
            remote_port: 80,
        }];
        let err = forward(&target(), &ports, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("binding forward listener"));
    }
}
