use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde_json::json;

use sbx_core::image::ImageRelease;
use sbx_core::sandbox::Sandbox;
use sbx_core::task::Task;
use sbx_engine::{CheckSeverity, EngineCheck};

/// Output format for list-style commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown output format {:?} (expected table or json)", other),
        }
    }
}

fn age(ts: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(ts);
    if delta.num_days() > 0 {
        format!("{}d", delta.num_days())
    } else if delta.num_hours() > 0 {
        format!("{}h", delta.num_hours())
    } else if delta.num_minutes() > 0 {
        format!("{}m", delta.num_minutes())
    } else {
        format!("{}s", delta.num_seconds().max(0))
    }
}

fn colored_status(status: &str) -> String {
    match status {
        "running" => status.green().to_string(),
        "stopped" => status.yellow().to_string(),
        "failed" => status.red().to_string(),
        other => other.dimmed().to_string(),
    }
}

pub fn sandboxes(list: &[Sandbox], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(list)?);
        }
        OutputFormat::Table => {
            if list.is_empty() {
                println!("No sandboxes.");
                return Ok(());
            }
            println!(
                "{}",
                format!(
                    "{:<20} {:<28} {:<10} {:<16} {:<6}",
                    "NAME", "ID", "STATUS", "IP", "AGE"
                )
                .bold()
            );
            for sandbox in list {
                println!(
                    "{:<20} {:<28} {:<10} {:<16} {:<6}",
                    sandbox.name,
                    sandbox.id,
                    colored_status(sandbox.status.as_str()),
                    sandbox.internal_ip.as_deref().unwrap_or("-"),
                    age(sandbox.created_at),
                );
            }
        }
    }
    Ok(())
}

pub fn sandbox_detail(sandbox: &Sandbox, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(sandbox)?);
        }
        OutputFormat::Table => {
            println!("{} {}", "Name:".bold(), sandbox.name);
            println!("{} {}", "ID:".bold(), sandbox.id);
            println!(
                "{} {}",
                "Status:".bold(),
                colored_status(sandbox.status.as_str())
            );
            println!(
                "{} {}",
                "IP:".bold(),
                sandbox.internal_ip.as_deref().unwrap_or("-")
            );
            println!(
                "{} {} vCPU / {} MB / {} GB",
                "Resources:".bold(),
                sandbox.config.resources.vcpus,
                sandbox.config.resources.memory_mb,
                sandbox.config.resources.disk_gb,
            );
            println!("{} {}", "Created:".bold(), sandbox.created_at.to_rfc3339());
            if let Some(started) = sandbox.started_at {
                println!("{} {}", "Started:".bold(), started.to_rfc3339());
            }
            if let Some(stopped) = sandbox.stopped_at {
                println!("{} {}", "Stopped:".bold(), stopped.to_rfc3339());
            }
            if let Some(error) = &sandbox.last_error {
                println!("{} {}", "Last error:".bold(), error.red());
            }
        }
    }
    Ok(())
}

pub fn images(list: &[ImageRelease], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(list)?);
        }
        OutputFormat::Table => {
            if list.is_empty() {
                println!("No images.");
                return Ok(());
            }
            println!(
                "{}",
                format!(
                    "{:<20} {:<12} {:<28} {:<10} {:<6}",
                    "NAME", "VERSION", "ID", "SIZE", "AGE"
                )
                .bold()
            );
            for image in list {
                let size = image
                    .virtual_size_bytes
                    .map(|b| format!("{}M", b >> 20))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<12} {:<28} {:<10} {:<6}",
                    image.name,
                    image.version,
                    image.id,
                    size,
                    age(image.created_at),
                );
            }
        }
    }
    Ok(())
}

pub fn tasks(list: &[Task], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(list)?);
        }
        OutputFormat::Table => {
            if list.is_empty() {
                println!("No recorded steps.");
                return Ok(());
            }
            println!(
                "{}",
                format!("{:<4} {:<24} {:<10} {}", "SEQ", "STEP", "STATUS", "ERROR").bold()
            );
            for task in list {
                println!(
                    "{:<4} {:<24} {:<10} {}",
                    task.sequence,
                    task.name,
                    colored_status(task.status.as_str()),
                    task.error.as_deref().unwrap_or(""),
                );
            }
        }
    }
    Ok(())
}

/// Render check results; returns true when no check failed.
pub fn checks(list: &[EngineCheck], format: OutputFormat) -> Result<bool> {
    let healthy = !list.iter().any(|c| c.severity == CheckSeverity::Error);
    match format {
        OutputFormat::Json => {
            let entries: Vec<_> = list
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "severity": c.severity.to_string(),
                        "message": c.message,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Table => {
            for check in list {
                let marker = match check.severity {
                    CheckSeverity::Ok => "ok".green().to_string(),
                    CheckSeverity::Warn => "warn".yellow().to_string(),
                    CheckSeverity::Error => "error".red().to_string(),
                };
                println!("{:<24} [{}] {}", check.id, marker, check.message);
            }
        }
    }
    Ok(healthy)
}
