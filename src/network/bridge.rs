//! Linux bridge helpers built on `ip`.

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::{debug, warn};

/// Checks if a link with this name exists
pub async fn bridge_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", "dev", name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Creates the bridge unless it is already there
pub async fn ensure_bridge(name: &str) -> Result<()> {
    if bridge_exists(name).await {
        debug!(bridge = %name, "bridge already exists, reusing");
        return Ok(());
    }

    debug!(bridge = %name, "creating bridge");
    let output = Command::new("ip")
        .args(["link", "add", "name", name, "type", "bridge"])
        .output()
        .await
        .context("executing ip link add")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Lost a race with someone else creating it
        if stderr.contains("File exists") {
            warn!(bridge = %name, "bridge appeared concurrently, reusing");
            return Ok(());
        }
        anyhow::bail!("failed to create bridge {}: {}", name, stderr.trim());
    }

    Ok(())
}

pub async fn set_link_up(name: &str) -> Result<()> {
    let output = Command::new("ip")
        .args(["link", "set", "dev", name, "up"])
        .output()
        .await
        .context("executing ip link set up")?;

    if !output.status.success() {
        anyhow::bail!(
            "failed to bring up {}: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Assigns `address/24`; an address that is already present is fine
pub async fn assign_address(name: &str, address: Ipv4Addr) -> Result<()> {
    let cidr = format!("{}/24", address);
    let output = Command::new("ip")
        .args(["addr", "add", &cidr, "dev", name])
        .output()
        .await
        .context("executing ip addr add")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") || stderr.contains("already assigned") {
            debug!(bridge = %name, address = %cidr, "address already assigned");
            return Ok(());
        }
        anyhow::bail!("failed to assign {} to {}: {}", cidr, name, stderr.trim());
    }
    Ok(())
}

/// Brings the bridge down and deletes it. A missing bridge is not an error.
pub async fn delete_bridge(name: &str) -> Result<()> {
    debug!(bridge = %name, "deleting bridge");

    let _ = Command::new("ip")
        .args(["link", "set", "dev", name, "down"])
        .output()
        .await;

    let output = Command::new("ip")
        .args(["link", "delete", "dev", name, "type", "bridge"])
        .output()
        .await
        .context("executing ip link delete")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
            debug!(bridge = %name, "bridge already gone");
            return Ok(());
        }
        anyhow::bail!("failed to delete bridge {}: {}", name, stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_lifecycle() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test_bridge_lifecycle - requires root");
            return;
        }

        let name = "rigdtestbr0";
        let _ = delete_bridge(name).await;

        ensure_bridge(name).await.unwrap();
        assert!(bridge_exists(name).await);

        // Creating again should be idempotent
        ensure_bridge(name).await.unwrap();
        set_link_up(name).await.unwrap();
        assign_address(name, Ipv4Addr::new(10, 10, 250, 1)).await.unwrap();
        assign_address(name, Ipv4Addr::new(10, 10, 250, 1)).await.unwrap();

        delete_bridge(name).await.unwrap();
        assert!(!bridge_exists(name).await);

        // Deleting again should be idempotent
        delete_bridge(name).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_bridge_does_not_exist() {
        assert!(!bridge_exists("rigd-nonexistent").await);
    }
}
