use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument};

use sbx_core::error::{not_found, not_valid};
use sbx_core::sandbox::SandboxStatus;
use sbx_engine::Engine;
use sbx_storage::Database;

use crate::resolve;

/// A parsed copy invocation. Exactly one of source/destination named the
/// sandbox side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub sandbox_ref: String,
    pub local_path: String,
    pub remote_path: String,
    /// Host→sandbox when true, sandbox→host otherwise.
    pub to_sandbox: bool,
}

/// Parse the `SANDBOXREF:REMOTE_PATH` copy grammar.
///
/// Exactly one of the two arguments must contain a colon; that side is the
/// sandbox side. Empty sandbox references and empty remote paths are
/// rejected.
pub fn parse_copy_args(src: &str, dst: &str) -> Result<CopyRequest> {
    match (src.split_once(':'), dst.split_once(':')) {
        (Some(_), Some(_)) => Err(not_valid(
            "both sides reference a sandbox; exactly one may contain a colon",
        )),
        (None, None) => Err(not_valid(
            "neither side references a sandbox; one must be SANDBOX:PATH",
        )),
        (Some((sandbox_ref, remote_path)), None) => {
            validate_sides(sandbox_ref, remote_path)?;
            Ok(CopyRequest {
                sandbox_ref: sandbox_ref.to_string(),
                local_path: dst.to_string(),
                remote_path: remote_path.to_string(),
                to_sandbox: false,
            })
        }
        (None, Some((sandbox_ref, remote_path))) => {
            validate_sides(sandbox_ref, remote_path)?;
            Ok(CopyRequest {
                sandbox_ref: sandbox_ref.to_string(),
                local_path: src.to_string(),
                remote_path: remote_path.to_string(),
                to_sandbox: true,
            })
        }
    }
}

fn validate_sides(sandbox_ref: &str, remote_path: &str) -> Result<()> {
    if sandbox_ref.is_empty() {
        return Err(not_valid("empty sandbox reference in copy argument"));
    }
    if remote_path.is_empty() {
        return Err(not_valid("empty remote path in copy argument"));
    }
    Ok(())
}

/// Copy a file between host and a running sandbox, in the direction the
/// argument grammar dictates.
#[instrument(skip_all)]
pub async fn copy(db: &Database, engine: &dyn Engine, src: &str, dst: &str) -> Result<()> {
    let request = parse_copy_args(src, dst)?;
    let sandbox = resolve::sandbox(db, &request.sandbox_ref)?;
    if sandbox.status != SandboxStatus::Running {
        return Err(not_valid(format!(
            "sandbox {:?} is {}; copy requires running",
            sandbox.name, sandbox.status
        )));
    }

    let local = Path::new(&request.local_path);
    if request.to_sandbox {
        if !local.exists() {
            return Err(not_found(format!(
                "local path {:?} does not exist",
                request.local_path
            )));
        }
        engine.copy_to(&sandbox, local, &request.remote_path).await?;
    } else {
        engine.copy_from(&sandbox, &request.remote_path, local).await?;
    }

    info!(
        sandbox_id = %sandbox.id,
        to_sandbox = request.to_sandbox,
        local = %request.local_path,
        remote = %request.remote_path,
        "copy complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::error::is_not_valid;

    #[test]
    fn test_parse_host_to_sandbox() {
        let request = parse_copy_args("./file.txt", "my-sandbox:/workspace/").unwrap();
        assert_eq!(
            request,
            CopyRequest {
                sandbox_ref: "my-sandbox".to_string(),
                local_path: "./file.txt".to_string(),
                remote_path: "/workspace/".to_string(),
                to_sandbox: true,
            }
        );
    }

    #[test]
    fn test_parse_sandbox_to_host() {
        let request = parse_copy_args("my-sandbox:/var/log/", "./logs/").unwrap();
        assert_eq!(
            request,
            CopyRequest {
                sandbox_ref: "my-sandbox".to_string(),
                local_path: "./logs/".to_string(),
                remote_path: "/var/log/".to_string(),
                to_sandbox: false,
            }
        );
    }

    #[test]
    fn test_parse_rejects_two_sandbox_sides() {
        let err = parse_copy_args("s1:/a", "s2:/b").unwrap_err();
        assert!(is_not_valid(&err));
    }

    #[test]
    fn test_parse_rejects_zero_sandbox_sides() {
        let err = parse_copy_args("./a", "./b").unwrap_err();
        assert!(is_not_valid(&err));
    }

    #[test]
    fn test_parse_rejects_empty_sandbox_ref() {
        let err = parse_copy_args(":/a", "./b").unwrap_err();
        assert!(is_not_valid(&err));
    }

    #[test]
    fn test_parse_rejects_empty_remote_path() {
        let err = parse_copy_args("s:", "./b").unwrap_err();
        assert!(is_not_valid(&err));
    }

    #[test]
    fn test_parse_keeps_extra_colons_in_remote_path() {
        let request = parse_copy_args("box:/path:with:colons", "./out").unwrap();
        assert_eq!(request.remote_path, "/path:with:colons");
    }

    mod service {
        use super::*;
        use crate::services::create::{CreateOptions, create};
        use crate::services::start::{StartOptions, start};
        use sbx_core::error::is_not_found;
        use sbx_core::sandbox::{EngineKind, SandboxConfig};
        use sbx_engine::FakeEngine;
        use sbx_storage::Database;

        async fn running(db: &Database, engine: &FakeEngine, name: &str) {
            create(
                db,
                engine,
                CreateOptions {
                    name: Some(name.to_string()),
                    config: SandboxConfig {
                        engine: Some(EngineKind::Fake),
                        ..SandboxConfig::default()
                    },
                    restore_from: None,
                },
            )
            .await
            .unwrap();
            start(db, engine, name, StartOptions::default()).await.unwrap();
        }

        #[tokio::test]
        async fn test_copy_to_running_sandbox() {
            let db = Database::open_in_memory().unwrap();
            let engine = FakeEngine::new();
            running(&db, &engine, "target").await;

            let file = tempfile::NamedTempFile::new().unwrap();
            let src = file.path().display().to_string();
            copy(&db, &engine, &src, "target:/workspace/file").await.unwrap();
        }

        #[tokio::test]
        async fn test_copy_missing_local_is_not_found() {
            let db = Database::open_in_memory().unwrap();
            let engine = FakeEngine::new();
            running(&db, &engine, "target2").await;

            let err = copy(&db, &engine, "/nonexistent/file", "target2:/workspace/file")
                .await
                .unwrap_err();
            assert!(is_not_found(&err));
        }

        #[tokio::test]
        async fn test_copy_requires_running() {
            let db = Database::open_in_memory().unwrap();
            let engine = FakeEngine::new();
            create(
                &db,
                &engine,
                CreateOptions {
                    name: Some("cold".to_string()),
                    config: SandboxConfig {
                        engine: Some(EngineKind::Fake),
                        ..SandboxConfig::default()
                    },
                    restore_from: None,
                },
            )
            .await
            .unwrap();

            let err = copy(&db, &engine, "cold:/a", "./b").await.unwrap_err();
            assert!(is_not_valid(&err));
        }

        #[tokio::test]
        async fn test_copy_from_sandbox_to_host() {
            let db = Database::open_in_memory().unwrap();
            let engine = FakeEngine::new();
            running(&db, &engine, "source").await;
            copy(&db, &engine, "source:/var/log/app.log", "./app.log")
                .await
                .unwrap();
        }
    }
}
