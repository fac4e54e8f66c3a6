//! Session environment installer, run on every successful start.
//!
//! The rendered script at `/etc/sbx/session-env.sh` is the sole host↔guest
//! contract for session env; any step failing here fails the whole start,
//! and the caller stops the VM rather than leave it running with an
//! incomplete session.

use std::io::Write;

use anyhow::{Context, Result, bail};

use sbx_core::sandbox::Sandbox;
use sbx_core::session::{self, SESSION_ENV_MODE, SESSION_ENV_PATH};

use crate::{Engine, ExecOptions};

async fn run_step(engine: &dyn Engine, sandbox: &Sandbox, argv: &[&str]) -> Result<()> {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    let status = engine
        .exec(sandbox, &argv, &ExecOptions::default())
        .await
        .with_context(|| format!("running {:?} in guest", argv.join(" ")))?;
    if status.exit_code != 0 {
        bail!(
            "guest command {:?} exited with {}",
            argv.join(" "),
            status.exit_code
        );
    }
    Ok(())
}

/// Push the session environment into the guest:
///
/// 1. `mkdir -p` the script directory and its companions
/// 2. render the script to a host temp file (sorted, byte-stable)
/// 3. upload it with CopyTo
/// 4. `chmod 644` the installed path
pub async fn install(engine: &dyn Engine, sandbox: &Sandbox) -> Result<()> {
    session::validate_env_keys(sandbox.session.env.keys().map(String::as_str))?;

    run_step(engine, sandbox, &["mkdir", "-p", "/etc/sbx", "/etc/profile.d"]).await?;

    let script = session::render_env_script(&sandbox.session.env);
    let mut file = tempfile::NamedTempFile::new().context("creating session env temp file")?;
    file.write_all(script.as_bytes())
        .context("writing session env temp file")?;
    file.flush()?;

    engine
        .copy_to(sandbox, file.path(), SESSION_ENV_PATH)
        .await
        .context("uploading session env script")?;

    run_step(engine, sandbox, &["chmod", SESSION_ENV_MODE, SESSION_ENV_PATH]).await?;
    Ok(())
}
