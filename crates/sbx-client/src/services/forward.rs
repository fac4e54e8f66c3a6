use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use sbx_core::error::not_valid;
use sbx_core::sandbox::SandboxStatus;
use sbx_engine::{Engine, PortForward};
use sbx_storage::Database;

use crate::resolve;

/// Expose guest ports on the host until `cancel` fires. Cancellation
/// returns `Ok`; every other engine error surfaces.
#[instrument(skip_all, fields(reference))]
pub async fn forward(
    db: &Database,
    engine: &dyn Engine,
    reference: &str,
    ports: &[PortForward],
    cancel: &CancellationToken,
) -> Result<()> {
    let sandbox = resolve::sandbox(db, reference)?;
    if sandbox.status != SandboxStatus::Running {
        return Err(not_valid(format!(
            "sandbox {:?} is {}; forward requires running",
            sandbox.name, sandbox.status
        )));
    }
    if ports.is_empty() {
        return Err(not_valid("forward requires at least one port"));
    }

    info!(sandbox_id = %sandbox.id, ports = ports.len(), "forwarding until cancelled");
    engine.forward(&sandbox, ports, cancel).await
}

/// Parse a `[bind_addr:]local:remote` port specification.
pub fn parse_port_spec(spec: &str) -> Result<PortForward> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (bind_addr, local_raw, remote_raw) = match parts.as_slice() {
        [local, remote] => ("127.0.0.1", *local, *remote),
        [bind, local, remote] => (*bind, *local, *remote),
        _ => {
            return Err(not_valid(format!(
                "port spec {:?} must be LOCAL:REMOTE or BIND:LOCAL:REMOTE",
                spec
            )));
        }
    };

    let local_port: u16 = local_raw
        .parse()
        .map_err(|_| not_valid(format!("invalid local port {:?}", local_raw)))?;
    let remote_port: u16 = remote_raw
        .parse()
        .map_err(|_| not_valid(format!("invalid remote port {:?}", remote_raw)))?;

    Ok(PortForward {
        bind_addr: bind_addr.to_string(),
        local_port,
        remote_port,
    })
}
