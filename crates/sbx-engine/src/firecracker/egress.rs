//! nftables egress rules for one sandbox.
//!
//! The egress proxy itself is an external collaborator; this module only
//! writes and flushes the per-sandbox rule set it consumes. Everything is
//! best-effort on teardown so a missing table never blocks stop/remove.

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, warn};

use sbx_core::session::{EgressAction, EgressPolicy};

fn table_name(sandbox_id: &str) -> String {
    // nft identifiers must start with a letter.
    format!("sbx_{}", sandbox_id.to_ascii_lowercase())
}

async fn run_nft(args: &[&str]) -> Result<()> {
    let output = Command::new("nft")
        .args(args)
        .output()
        .await
        .with_context(|| format!("running: nft {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "nft {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Install the forward-chain policy for a guest IP.
pub async fn apply(sandbox_id: &str, guest_ip: &str, policy: &EgressPolicy) -> Result<()> {
    let table = table_name(sandbox_id);
    debug!(table = %table, guest_ip, "applying egress policy");

    // Rebuild the table from scratch; rules are tiny and idempotency beats
    // incremental edits.
    let _ = run_nft(&["delete", "table", "ip", &table]).await;
    run_nft(&["add", "table", "ip", &table]).await?;

    let chain_spec = format!(
        "{{ type filter hook forward priority 0 ; policy {} ; }}",
        match policy.default_action {
            EgressAction::Allow => "accept",
            EgressAction::Deny => "drop",
        }
    );
    run_nft(&["add", "chain", "ip", &table, "egress", &chain_spec]).await?;

    // Exceptions to the default, scoped to this guest's source address.
    let verdict = match policy.default_action {
        EgressAction::Allow => "drop",
        EgressAction::Deny => "accept",
    };
    for cidr in &policy.allow {
        let rule = format!("ip saddr {} ip daddr {} {}", guest_ip, cidr, verdict);
        run_nft(&["add", "rule", "ip", &table, "egress", &rule]).await?;
    }

    Ok(())
}

/// Drop the sandbox's rule table. Missing tables are fine.
pub async fn flush(sandbox_id: &str) {
    let table = table_name(sandbox_id);
    if let Err(e) = run_nft(&["delete", "table", "ip", &table]).await {
        debug!(table = %table, error = %e, "egress table not removed");
    }
}

/// Warn-level sweep used by remove when rules may be left behind.
pub async fn flush_quiet(sandbox_id: &str) {
    let table = table_name(sandbox_id);
    if let Err(e) = run_nft(&["delete", "table", "ip", &table]).await {
        let msg = e.to_string();
        if !msg.contains("No such file or directory") && !msg.contains("does not exist") {
            warn!(table = %table, error = %msg, "egress cleanup");
        }
    }
}
