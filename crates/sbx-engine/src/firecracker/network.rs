//! Tap device and /30 host↔guest addressing for one microVM.
//!
//! Addresses are derived deterministically from the sandbox ID inside
//! 172.30.0.0/16: each sandbox gets a four-address block with the host on
//! `.base+1` and the guest on `.base+2`. The tap name embeds the same index
//! so every resource is reclaimable from the ID alone.

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

/// Network identity of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNet {
    pub tap_dev: String,
    pub guest_mac: String,
    pub host_ip: String,
    pub guest_ip: String,
    /// Prefix length of the point-to-point block.
    pub cidr: u8,
}

/// Stable 64-bit FNV-1a over the sandbox ID. `DefaultHasher` is seeded per
/// process, which would break tap reclamation across restarts.
fn stable_hash(id: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Derive the network identity for a sandbox ID.
pub fn net_for_id(id: &str) -> GuestNet {
    // 16384 /30 blocks fit in the /16.
    let index = (stable_hash(id) % 16384) as u32;
    let base = index * 4;
    let (hi, lo) = (base / 256, base % 256);

    GuestNet {
        // "sbx" + 4 hex digits stays well under the 15-char IFNAMSIZ limit.
        tap_dev: format!("sbx{:04x}", index),
        // Locally administered, derived from the block index.
        guest_mac: format!("06:00:ac:1e:{:02x}:{:02x}", hi, lo + 2),
        host_ip: format!("172.30.{}.{}", hi, lo + 1),
        guest_ip: format!("172.30.{}.{}", hi, lo + 2),
        cidr: 30,
    }
}

/// Kernel command line fragment configuring the guest's static address.
pub fn boot_ip_args(net: &GuestNet) -> String {
    format!(
        "ip={}::{}:255.255.255.252::eth0:off",
        net.guest_ip, net.host_ip
    )
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .with_context(|| format!("running: ip {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Create and address the tap device for a sandbox. Any stale device with
/// the same name is replaced.
pub async fn setup_tap(net: &GuestNet) -> Result<()> {
    debug!(tap = %net.tap_dev, host_ip = %net.host_ip, "setting up tap device");

    let _ = Command::new("ip")
        .args(["link", "del", &net.tap_dev])
        .output()
        .await;

    run_ip(&["tuntap", "add", "dev", &net.tap_dev, "mode", "tap"]).await?;
    run_ip(&[
        "addr",
        "add",
        &format!("{}/{}", net.host_ip, net.cidr),
        "dev",
        &net.tap_dev,
    ])
    .await?;
    run_ip(&["link", "set", &net.tap_dev, "up"]).await?;
    Ok(())
}

/// Reclaim the tap device. Missing devices are fine.
pub async fn teardown_tap(tap_dev: &str) -> Result<()> {
    let _ = Command::new("ip")
        .args(["link", "del", tap_dev])
        .output()
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_is_deterministic() {
        let a = net_for_id("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        let b = net_for_id("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_and_guest_share_a_block() {
        let net = net_for_id("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        let host_last: u32 = net.host_ip.rsplit('.').next().unwrap().parse().unwrap();
        let guest_last: u32 = net.guest_ip.rsplit('.').next().unwrap().parse().unwrap();
        assert_eq!(guest_last, host_last + 1);
        assert_eq!(host_last % 4, 1);
        assert!(net.host_ip.starts_with("172.30."));
        assert_eq!(net.cidr, 30);
    }

    #[test]
    fn test_tap_name_fits_linux_limit() {
        let net = net_for_id("7ZZZZZZZZZZZZZZZZZZZZZZZZZ");
        assert!(net.tap_dev.len() <= 15, "tap name too long: {}", net.tap_dev);
        assert!(net.tap_dev.starts_with("sbx"));
    }

    #[test]
    fn test_mac_is_locally_administered() {
        let net = net_for_id("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert!(net.guest_mac.starts_with("06:00:"));
        assert_eq!(net.guest_mac.len(), 17);
    }

    #[test]
    fn test_distinct_ids_mostly_get_distinct_blocks() {
        let a = net_for_id("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        let b = net_for_id("01BX5ZZKBKACTAV9WEVGEMMVRZ");
        assert_ne!(a.tap_dev, b.tap_dev);
    }

    #[test]
    fn test_boot_ip_args_shape() {
        let net = net_for_id("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        let args = boot_ip_args(&net);
        assert!(args.starts_with(&format!("ip={}::", net.guest_ip)));
        assert!(args.ends_with(":eth0:off"));
        assert!(args.contains("255.255.255.252"));
    }
}
