//! Subnet selection for virtual-device bridges.
//!
//! The host namespace is shared with everything else on the machine, so the
//! block is chosen by probing the addresses actually configured right now
//! rather than by hashing an id.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use tracing::debug;

use super::types::BridgeAllocation;
use crate::error::WorkerError;
use crate::utils::run_checked;

/// Third octet range scanned for `10.10.N.0/24`
pub const FIRST_BLOCK: u8 = 10;
pub const LAST_BLOCK: u8 = 254;

#[derive(Deserialize)]
struct IpInterface {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    local: Option<String>,
}

/// Extract IPv4 addresses from `ip -json addr` output
pub fn parse_ip_json(json: &str) -> Result<Vec<Ipv4Addr>> {
    let interfaces: Vec<IpInterface> =
        serde_json::from_str(json).context("parsing `ip -json addr` output")?;

    Ok(interfaces
        .iter()
        .flat_map(|iface| iface.addr_info.iter())
        .filter(|info| info.family.as_deref().map_or(true, |f| f == "inet"))
        .filter_map(|info| info.local.as_deref()?.parse().ok())
        .collect())
}

/// Addresses currently configured on the host
pub async fn host_addresses() -> Result<Vec<Ipv4Addr>> {
    let output = run_checked("ip", &["-json", "addr"]).await?;
    parse_ip_json(&String::from_utf8_lossy(&output.stdout))
}

/// Lowest `N` for which no host address lies in `10.10.N.0/24`
pub fn pick_block(in_use: &[Ipv4Addr]) -> Result<u8> {
    (FIRST_BLOCK..=LAST_BLOCK)
        .find(|&n| {
            !in_use.iter().any(|addr| {
                let o = addr.octets();
                o[0] == 10 && o[1] == 10 && o[2] == n
            })
        })
        .ok_or_else(|| {
            WorkerError::Provisioning(format!(
                "no free subnet left in 10.10.{}.0/24 - 10.10.{}.0/24",
                FIRST_BLOCK, LAST_BLOCK
            ))
            .into()
        })
}

/// Gateway `.1`, DHCP hands out `.2` to `.254`
pub fn allocation_for_block(bridge_name: &str, n: u8) -> BridgeAllocation {
    BridgeAllocation {
        bridge_name: bridge_name.to_string(),
        bridge_address: Ipv4Addr::new(10, 10, n, 1),
        dhcp_range: format!("10.10.{n}.2,10.10.{n}.254"),
    }
}

/// Probe the host and allocate the first free block for `bridge_name`
pub async fn allocate(bridge_name: &str) -> Result<BridgeAllocation> {
    let in_use = host_addresses().await?;
    let n = pick_block(&in_use)?;
    debug!(bridge = %bridge_name, block = n, in_use = in_use.len(), "picked bridge subnet");
    Ok(allocation_for_block(bridge_name, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::worker_error;

    const IP_JSON: &str = r#"[
        {"ifindex":1,"ifname":"lo","addr_info":[
            {"family":"inet","local":"127.0.0.1","prefixlen":8},
            {"family":"inet6","local":"::1","prefixlen":128}]},
        {"ifindex":2,"ifname":"eth0","addr_info":[
            {"family":"inet","local":"192.168.1.20","prefixlen":24}]},
        {"ifindex":5,"ifname":"brab12cd34","addr_info":[
            {"family":"inet","local":"10.10.10.1","prefixlen":24}]},
        {"ifindex":6,"ifname":"wg0"}
    ]"#;

    #[test]
    fn test_parse_ip_json() {
        let addrs = parse_ip_json(IP_JSON).unwrap();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(127, 0, 0, 1),
                Ipv4Addr::new(192, 168, 1, 20),
                Ipv4Addr::new(10, 10, 10, 1),
            ]
        );
    }

    #[test]
    fn test_first_free_block_skips_leftover_bridge() {
        let addrs = parse_ip_json(IP_JSON).unwrap();
        assert_eq!(pick_block(&addrs).unwrap(), 11);
        assert_eq!(pick_block(&[]).unwrap(), FIRST_BLOCK);
    }

    #[test]
    fn test_any_address_claims_the_block() {
        // A DHCP lease inside the block counts, not just the gateway
        let in_use = [Ipv4Addr::new(10, 10, 10, 57)];
        assert_eq!(pick_block(&in_use).unwrap(), 11);
    }

    #[test]
    fn test_last_block_selected_when_pool_nearly_exhausted() {
        let in_use: Vec<Ipv4Addr> = (FIRST_BLOCK..=253)
            .map(|n| Ipv4Addr::new(10, 10, n, 1))
            .collect();
        let n = pick_block(&in_use).unwrap();
        assert_eq!(n, 254);
        assert_eq!(
            allocation_for_block("br0", n).bridge_address,
            Ipv4Addr::new(10, 10, 254, 1)
        );
    }

    #[test]
    fn test_exhausted_pool_is_provisioning_error() {
        let in_use: Vec<Ipv4Addr> = (FIRST_BLOCK..=LAST_BLOCK)
            .map(|n| Ipv4Addr::new(10, 10, n, 1))
            .collect();
        let err = pick_block(&in_use).unwrap_err();
        assert!(matches!(
            worker_error(&err),
            Some(WorkerError::Provisioning(_))
        ));
    }

    #[test]
    fn test_allocation_ranges() {
        let alloc = allocation_for_block("brtest", 42);
        assert_eq!(alloc.bridge_address, Ipv4Addr::new(10, 10, 42, 1));
        assert_eq!(alloc.dhcp_range, "10.10.42.2,10.10.42.254");
    }
}
