use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use sbx_core::error::{not_found, not_valid};
use sbx_core::sandbox::SandboxStatus;
use sbx_engine::{Engine, ExecOptions, ExecStatus};
use sbx_storage::Database;

use crate::resolve;

/// One exec invocation. A non-zero guest exit code is a result, not an
/// error; the CLI surfaces it verbatim.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub tty: bool,
    /// Files uploaded into the working directory before the command runs.
    pub uploads: Vec<PathBuf>,
}

#[instrument(skip_all, fields(reference))]
pub async fn exec(
    db: &Database,
    engine: &dyn Engine,
    reference: &str,
    request: ExecRequest,
) -> Result<ExecStatus> {
    let sandbox = resolve::sandbox(db, reference)?;
    if sandbox.status != SandboxStatus::Running {
        return Err(not_valid(format!(
            "sandbox {:?} is {}; exec requires running",
            sandbox.name, sandbox.status
        )));
    }
    if request.argv.is_empty() {
        return Err(not_valid("exec requires a non-empty argv"));
    }

    if !request.uploads.is_empty() {
        let cwd = request
            .cwd
            .as_deref()
            .ok_or_else(|| not_valid("uploads require a working directory"))?;

        let mkdir = engine
            .exec(
                &sandbox,
                &["mkdir".to_string(), "-p".to_string(), cwd.to_string()],
                &ExecOptions::default(),
            )
            .await?;
        if mkdir.exit_code != 0 {
            anyhow::bail!("creating working directory {:?} failed", cwd);
        }

        for local in &request.uploads {
            if !local.exists() {
                return Err(not_found(format!(
                    "upload source {} does not exist",
                    local.display()
                )));
            }
            let file_name = local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| not_valid(format!("upload source {} has no file name", local.display())))?;
            let remote = format!("{}/{}", cwd.trim_end_matches('/'), file_name);
            debug!(local = %local.display(), remote = %remote, "uploading");
            engine
                .copy_to(&sandbox, local, &remote)
                .await
                .with_context(|| format!("uploading {}", local.display()))?;
        }
    }

    engine
        .exec(
            &sandbox,
            &request.argv,
            &ExecOptions {
                cwd: request.cwd,
                env: request.env,
                tty: request.tty,
            },
        )
        .await
}
