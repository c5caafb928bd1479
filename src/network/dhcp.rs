use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

use super::types::BridgeAllocation;
use crate::process::{ManagedProcess, OutputMode};

/// dnsmasq arguments serving DHCP only, bound to the bridge alone
pub fn dnsmasq_args(alloc: &BridgeAllocation) -> Vec<String> {
    vec![
        format!("--interface={}", alloc.bridge_name),
        format!("--dhcp-range={}", alloc.dhcp_range),
        // Ignore /etc/dnsmasq.conf
        "--conf-file".to_string(),
        "--except-interface=lo".to_string(),
        "--bind-interfaces".to_string(),
        "--no-daemon".to_string(),
        format!(
            "--dhcp-leasefile=/var/run/qemu-dnsmasq-{}.leases",
            alloc.bridge_name
        ),
        // DNS disabled
        "--port=0".to_string(),
    ]
}

/// DHCP server for one bridge
pub struct DhcpServer {
    bridge_name: String,
    process: ManagedProcess,
}

impl DhcpServer {
    pub fn start(alloc: &BridgeAllocation) -> Result<Self> {
        let mut cmd = Command::new("dnsmasq");
        cmd.args(dnsmasq_args(alloc));

        let process = ManagedProcess::spawn("dnsmasq", cmd, OutputMode::Log)
            .with_context(|| format!("starting DHCP server on {}", alloc.bridge_name))?;

        info!(bridge = %alloc.bridge_name, range = %alloc.dhcp_range, "DHCP server started");
        Ok(Self {
            bridge_name: alloc.bridge_name.clone(),
            process,
        })
    }

    /// Kill and wait; resolves immediately if the server already exited.
    pub async fn stop(&mut self) {
        self.process.stop().await;
        info!(bridge = %self.bridge_name, "DHCP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_dnsmasq_args() {
        let alloc = BridgeAllocation {
            bridge_name: "br5k2x9q1m".into(),
            bridge_address: Ipv4Addr::new(10, 10, 10, 1),
            dhcp_range: "10.10.10.2,10.10.10.254".into(),
        };
        let args = dnsmasq_args(&alloc);
        assert_eq!(args[0], "--interface=br5k2x9q1m");
        assert_eq!(args[1], "--dhcp-range=10.10.10.2,10.10.10.254");
        assert!(args.contains(&"--port=0".to_string()));
        assert!(args.contains(&"--bind-interfaces".to_string()));
        assert!(args
            .iter()
            .any(|a| a == "--dhcp-leasefile=/var/run/qemu-dnsmasq-br5k2x9q1m.leases"));
    }
}
