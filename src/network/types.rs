use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Network configuration requested by the orchestrator for the DUT
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRequest {
    #[serde(default)]
    pub wired: Option<WiredRequest>,
    #[serde(default)]
    pub wireless: Option<WirelessRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WiredRequest {
    /// Share the host's uplink with the DUT
    #[serde(default)]
    pub nat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirelessRequest {
    pub ssid: String,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub nat: bool,
}

/// Name of the host-side connection serving the DUT (interface or profile)
pub type ConnectionDescriptor = String;

/// Network view a worker exposes after a successful `network()` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wired: Option<ConnectionDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wireless: Option<ConnectionDescriptor>,
}

/// Bridge network reserved for one virtual-device session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeAllocation {
    pub bridge_name: String,
    pub bridge_address: Ipv4Addr,
    /// dnsmasq range syntax: "first,last"
    pub dhcp_range: String,
}

impl BridgeAllocation {
    /// Source network in CIDR form, used by the NAT rule
    pub fn cidr(&self) -> String {
        format!("{}/24", self.bridge_address)
    }
}
