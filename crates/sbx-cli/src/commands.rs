use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use sbx_client::{
    Client, ClientConfig, CreateOptions, ExecRequest, SnapshotOptions, StartOptions,
    parse_port_spec,
};
use sbx_core::error::not_valid;
use sbx_core::sandbox::{EngineKind, Resources, SandboxConfig};
use sbx_core::session::{EgressAction, EgressPolicy};
use sbx_core::task::Operation;

use crate::display::{self, OutputFormat};
use crate::logging::{self, LogFormat};
use crate::ui;

#[derive(Parser)]
#[command(
    name = "sbx",
    version,
    about = "Manage Firecracker-backed sandboxes"
)]
struct Cli {
    /// Output format: table, json
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: String,

    /// TOML config file with defaults (db path, data dir, image paths)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (default: ~/.sbx/sbx.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Data directory (default: ~/.sbx)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Force an engine: firecracker, fake
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Emit JSON logs instead of human-readable ones
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox (never boots it)
    Create {
        /// Sandbox name; auto-generated when omitted
        name: Option<String>,
        /// Root filesystem image for the Firecracker engine
        #[arg(long)]
        rootfs: Option<String>,
        /// Kernel image for the Firecracker engine
        #[arg(long)]
        kernel: Option<String>,
        /// vCPUs (fractional allowed)
        #[arg(long, short = 'c')]
        cpus: Option<f64>,
        /// Memory in MB
        #[arg(long, short = 'm')]
        memory: Option<i64>,
        /// Disk in GB
        #[arg(long)]
        disk: Option<i64>,
        /// Base the sandbox on a catalog image (name or name:version)
        #[arg(long)]
        restore_from: Option<String>,
    },
    /// Start a sandbox and install its session environment
    Start {
        sandbox: String,
        /// Session env entry KEY=VALUE; repeatable
        #[arg(long, short = 'e')]
        env: Vec<String>,
        /// Deny all egress traffic by default
        #[arg(long)]
        egress_deny: bool,
        /// CIDR exception to the default egress action; repeatable
        #[arg(long)]
        egress_allow: Vec<String>,
    },
    /// Stop a running sandbox
    Stop { sandbox: String },
    /// Remove a sandbox
    Rm {
        sandbox: String,
        /// Remove even if running (best-effort stop first)
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// List sandboxes
    Ls,
    /// Show one sandbox, including the backend view and recent steps
    Status { sandbox: String },
    /// Run a command in a running sandbox; exits with the command's code
    Exec {
        sandbox: String,
        /// Working directory in the guest
        #[arg(long)]
        cwd: Option<String>,
        /// Extra env entry KEY=VALUE; repeatable
        #[arg(long, short = 'e')]
        env: Vec<String>,
        /// Allocate a pseudo-terminal
        #[arg(long, short = 't')]
        tty: bool,
        /// Upload a file into the working directory first; repeatable
        #[arg(long)]
        upload: Vec<PathBuf>,
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
    },
    /// Copy files between host and sandbox (SANDBOX:PATH on one side)
    Cp { src: String, dst: String },
    /// Forward guest ports to the host until interrupted
    Forward {
        sandbox: String,
        /// Port spec LOCAL:REMOTE or BIND:LOCAL:REMOTE; repeatable
        #[arg(required = true)]
        ports: Vec<String>,
    },
    /// Snapshot a stopped sandbox's rootfs into the image catalog
    Snapshot {
        sandbox: String,
        /// Catalog name (default: sandbox name)
        #[arg(long)]
        name: Option<String>,
        /// Catalog version (default: creation epoch)
        #[arg(long)]
        version: Option<String>,
        /// Destination file (default: under the data dir)
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// List catalog images
    Images,
    /// Pull an image release from the registry
    Pull { image: String },
    /// Diagnose the engine and store
    Check,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// TOML config file consumed by `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    engine: Option<String>,
    registry_url: Option<String>,
    firecracker_binary: Option<PathBuf>,
    ssh_user: Option<String>,
    ssh_identity: Option<PathBuf>,
    rootfs_path: Option<String>,
    kernel_image_path: Option<String>,
}

impl FileConfig {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| not_valid(format!("env entry {:?} must be KEY=VALUE", pair)))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn parse_engine(s: &str) -> Result<EngineKind> {
    EngineKind::parse(s).map_err(|_| not_valid(format!("unknown engine {:?}", s)))
}

/// Parse arguments, run the selected command, and turn the outcome into a
/// process exit code. `exec` surfaces the guest command's exit code.
pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    logging::init(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            ui::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "sbx",
            &mut std::io::stdout(),
        );
        return Ok(ExitCode::SUCCESS);
    }

    let format = OutputFormat::parse(&cli.output)?;
    let file = FileConfig::load(cli.config.as_ref())?;

    let engine = match cli.engine.as_deref().or(file.engine.as_deref()) {
        Some(raw) => Some(parse_engine(raw)?),
        None => None,
    };

    let client = Client::open(ClientConfig {
        db_path: cli.db.or(file.db_path),
        data_dir: cli.data_dir.or(file.data_dir.clone()),
        engine,
        firecracker_binary: file.firecracker_binary.clone(),
        ssh_user: file.ssh_user.clone(),
        ssh_identity: file.ssh_identity.clone(),
        registry_url: file.registry_url.clone(),
    })?;

    let code = match cli.command {
        Commands::Create {
            name,
            rootfs,
            kernel,
            cpus,
            memory,
            disk,
            restore_from,
        } => {
            let defaults = Resources::default();
            let config = SandboxConfig {
                engine: None,
                rootfs_path: rootfs.or(file.rootfs_path),
                kernel_image_path: kernel.or(file.kernel_image_path),
                resources: Resources {
                    vcpus: cpus.unwrap_or(defaults.vcpus),
                    memory_mb: memory.unwrap_or(defaults.memory_mb),
                    disk_gb: disk.unwrap_or(defaults.disk_gb),
                },
            };
            let sandbox = client
                .create(CreateOptions {
                    name,
                    config,
                    restore_from,
                })
                .await?;
            ui::success(&format!("Created {} ({})", sandbox.name, sandbox.id));
            ExitCode::SUCCESS
        }

        Commands::Start {
            sandbox,
            env,
            egress_deny,
            egress_allow,
        } => {
            let env = parse_env_pairs(&env)?;
            let egress = (egress_deny || !egress_allow.is_empty()).then(|| EgressPolicy {
                default_action: if egress_deny {
                    EgressAction::Deny
                } else {
                    EgressAction::Allow
                },
                allow: egress_allow,
            });
            let spinner = ui::spinner(&format!("Starting {}...", sandbox));
            let result = client.start(&sandbox, StartOptions { env, egress }).await;
            spinner.finish_and_clear();
            let started = result?;
            ui::success(&format!(
                "Started {} ({})",
                started.name,
                started.internal_ip.as_deref().unwrap_or("no address")
            ));
            ExitCode::SUCCESS
        }

        Commands::Stop { sandbox } => {
            let stopped = client.stop(&sandbox).await?;
            ui::success(&format!("Stopped {}", stopped.name));
            ExitCode::SUCCESS
        }

        Commands::Rm { sandbox, force } => {
            client.remove(&sandbox, force).await?;
            ui::success(&format!("Removed {}", sandbox));
            ExitCode::SUCCESS
        }

        Commands::Ls => {
            display::sandboxes(&client.list()?, format)?;
            ExitCode::SUCCESS
        }

        Commands::Status { sandbox } => {
            let (record, view) = client.status(&sandbox).await?;
            display::sandbox_detail(&record, format)?;
            if format == OutputFormat::Table {
                if let Some(view) = view {
                    ui::info(&format!(
                        "Backend: {}{}",
                        view.status,
                        view.pid.map(|p| format!(" (pid {})", p)).unwrap_or_default()
                    ));
                }
                if let Some(pending) = client.pending_operation(&sandbox)? {
                    let progress = client.progress(&sandbox, pending)?;
                    ui::warn(&format!(
                        "Interrupted {} ({}/{} steps done); re-run the operation to continue",
                        pending, progress.done, progress.total,
                    ));
                }
                for operation in [Operation::Create, Operation::Start, Operation::Stop] {
                    let tasks = client.tasks(&sandbox, operation)?;
                    if !tasks.is_empty() {
                        println!("\n{} steps:", operation);
                        display::tasks(&tasks, format)?;
                    }
                }
            }
            ExitCode::SUCCESS
        }

        Commands::Exec {
            sandbox,
            cwd,
            env,
            tty,
            upload,
            argv,
        } => {
            let status = client
                .exec(
                    &sandbox,
                    ExecRequest {
                        argv,
                        cwd,
                        env: parse_env_pairs(&env)?,
                        tty,
                        uploads: upload,
                    },
                )
                .await?;
            // The guest command's exit code is the CLI's exit code; codes
            // outside u8 range (signal deaths) collapse to failure.
            ExitCode::from(u8::try_from(status.exit_code).unwrap_or(1))
        }

        Commands::Cp { src, dst } => {
            client.copy(&src, &dst).await?;
            ui::success("Copy complete");
            ExitCode::SUCCESS
        }

        Commands::Forward { sandbox, ports } => {
            let ports = ports
                .iter()
                .map(|spec| parse_port_spec(spec))
                .collect::<Result<Vec<_>>>()?;
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                canceller.cancel();
            });
            ui::info("Forwarding; press Ctrl-C to stop.");
            client.forward(&sandbox, &ports, &cancel).await?;
            ExitCode::SUCCESS
        }

        Commands::Snapshot {
            sandbox,
            name,
            version,
            dest,
        } => {
            let spinner = ui::spinner(&format!("Snapshotting {}...", sandbox));
            let result = client
                .snapshot(&sandbox, SnapshotOptions { name, version, dest })
                .await;
            spinner.finish_and_clear();
            let image = result?;
            ui::success(&format!(
                "Snapshot {}:{} ({} virtual / {} allocated bytes)",
                image.name,
                image.version,
                image.virtual_size_bytes.unwrap_or(0),
                image.allocated_size_bytes.unwrap_or(0),
            ));
            ExitCode::SUCCESS
        }

        Commands::Images => {
            display::images(&client.images()?, format)?;
            ExitCode::SUCCESS
        }

        Commands::Pull { image } => {
            let spinner = ui::spinner(&format!("Pulling {}...", image));
            let result = client.pull(&image).await;
            spinner.finish_and_clear();
            let release = result?;
            ui::success(&format!("Pulled {}:{}", release.name, release.version));
            ExitCode::SUCCESS
        }

        Commands::Check => {
            let healthy = display::checks(&client.check().await, format)?;
            if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }

        Commands::Completions { .. } => unreachable!("handled before client setup"),
    };

    client.close();
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_all_subcommands() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env_pairs(&["A=1".to_string(), "B=two=halves".to_string()]).unwrap();
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two=halves"));
        assert!(parse_env_pairs(&["NOVALUE".to_string()]).is_err());
    }

    #[test]
    fn test_parse_engine_names() {
        assert_eq!(parse_engine("fake").unwrap(), EngineKind::Fake);
        assert_eq!(parse_engine("firecracker").unwrap(), EngineKind::Firecracker);
        assert!(parse_engine("docker").is_err());
    }

    #[test]
    fn test_file_config_parses_toml() {
        let config: FileConfig = toml::from_str(
            r#"
            db_path = "/tmp/sbx.db"
            engine = "fake"
            rootfs_path = "/images/rootfs.ext4"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/sbx.db")));
        assert_eq!(config.engine.as_deref(), Some("fake"));
    }

    #[test]
    fn test_file_config_rejects_unknown_keys() {
        let result: Result<FileConfig, _> = toml::from_str("unknown_key = 1");
        assert!(result.is_err());
    }
}
