use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use tracing::{info, warn};

use super::dhcp::DhcpServer;
use super::types::BridgeAllocation;
use super::{bridge, nat, subnet};
use crate::config::NetworkOptions;
use crate::error::WorkerError;

/// Host-side operations behind provisioning
#[async_trait::async_trait]
pub trait HostNetwork: Send + Sync {
    async fn ensure_bridge(&mut self, name: &str) -> Result<()>;
    async fn set_link_up(&mut self, name: &str) -> Result<()>;
    async fn assign_address(&mut self, name: &str, address: Ipv4Addr) -> Result<()>;
    async fn add_masquerade(&mut self, alloc: &BridgeAllocation) -> Result<()>;
    async fn remove_masquerade(&mut self, bridge_name: &str) -> Result<()>;
    async fn delete_bridge(&mut self, name: &str) -> Result<()>;
    async fn start_dhcp(&mut self, alloc: &BridgeAllocation) -> Result<()>;
    /// No-op when no server is running
    async fn stop_dhcp(&mut self);
}

/// iproute2, iptables and dnsmasq on this host
#[derive(Default)]
pub struct SystemNetwork {
    dhcp: Option<DhcpServer>,
}

#[async_trait::async_trait]
impl HostNetwork for SystemNetwork {
    async fn ensure_bridge(&mut self, name: &str) -> Result<()> {
        bridge::ensure_bridge(name).await
    }

    async fn set_link_up(&mut self, name: &str) -> Result<()> {
        bridge::set_link_up(name).await
    }

    async fn assign_address(&mut self, name: &str, address: Ipv4Addr) -> Result<()> {
        bridge::assign_address(name, address).await
    }

    async fn add_masquerade(&mut self, alloc: &BridgeAllocation) -> Result<()> {
        nat::add_masquerade(alloc).await
    }

    async fn remove_masquerade(&mut self, bridge_name: &str) -> Result<()> {
        nat::remove_masquerade(bridge_name).await
    }

    async fn delete_bridge(&mut self, name: &str) -> Result<()> {
        bridge::delete_bridge(name).await
    }

    async fn start_dhcp(&mut self, alloc: &BridgeAllocation) -> Result<()> {
        self.dhcp = Some(DhcpServer::start(alloc)?);
        Ok(())
    }

    async fn stop_dhcp(&mut self) {
        if let Some(mut dhcp) = self.dhcp.take() {
            dhcp.stop().await;
        }
    }
}

/// Isolated bridge network for a virtual device
///
/// With autoconfigure on, `setup` creates (in order) the bridge, its
/// address, a tagged masquerade rule and a DHCP server. State is recorded as
/// each step lands; a failed step is reported and the partial state stays
/// recorded for `teardown` to reclaim.
///
/// With autoconfigure off the operator owns the bridge and nothing is
/// created or removed here.
pub struct NetworkProvisioner {
    options: NetworkOptions,
    session_id: String,
    host: Box<dyn HostNetwork>,

    // Populated during setup
    allocation: Option<BridgeAllocation>,
    dhcp_running: bool,
}

impl NetworkProvisioner {
    pub fn new(options: NetworkOptions, session_id: String) -> Self {
        Self::with_host(options, session_id, Box::<SystemNetwork>::default())
    }

    pub fn with_host(
        options: NetworkOptions,
        session_id: String,
        host: Box<dyn HostNetwork>,
    ) -> Self {
        Self {
            options,
            session_id,
            host,
            allocation: None,
            dhcp_running: false,
        }
    }

    pub fn autoconfigure(&self) -> bool {
        self.options.autoconfigure
    }

    pub fn allocation(&self) -> Option<&BridgeAllocation> {
        self.allocation.as_ref()
    }

    /// Bridge the VM should attach to, if one is known yet
    pub fn bridge_name(&self) -> Option<&str> {
        self.allocation
            .as_ref()
            .map(|a| a.bridge_name.as_str())
            .or(self.options.bridge_name.as_deref())
    }

    fn pick_bridge_name(&self) -> String {
        self.options
            .bridge_name
            .clone()
            .unwrap_or_else(|| format!("br{}", self.session_id))
    }

    /// Provision the network and return the bridge name.
    pub async fn setup(&mut self) -> Result<String> {
        if !self.options.autoconfigure {
            let name = self.options.bridge_name.clone().ok_or_else(|| {
                WorkerError::Provisioning(
                    "autoconfigure is disabled and no bridge name was supplied".into(),
                )
            })?;
            info!(bridge = %name, "using operator-managed bridge");
            return Ok(name);
        }

        if let Some(alloc) = &self.allocation {
            if self.dhcp_running {
                info!(bridge = %alloc.bridge_name, "network already provisioned");
                return Ok(alloc.bridge_name.clone());
            }
        }

        let bridge_name = self.pick_bridge_name();
        let alloc = match self.options.bridge_address {
            Some(address) => {
                let dhcp_range = self.options.dhcp_range.clone().ok_or_else(|| {
                    WorkerError::Provisioning(
                        "a bridge address was supplied without a DHCP range".into(),
                    )
                })?;
                BridgeAllocation {
                    bridge_name: bridge_name.clone(),
                    bridge_address: address,
                    dhcp_range,
                }
            }
            // Nothing exists yet if this fails
            None => subnet::allocate(&bridge_name).await?,
        };

        info!(
            bridge = %alloc.bridge_name,
            address = %alloc.bridge_address,
            range = %alloc.dhcp_range,
            "provisioning bridge network"
        );

        // Store state progressively for teardown
        self.allocation = Some(alloc.clone());

        // Step 1: Bridge device
        self.host
            .ensure_bridge(&alloc.bridge_name)
            .await
            .map_err(provisioning)
            .context("creating bridge")?;

        // Step 2: Up, then address
        self.host
            .set_link_up(&alloc.bridge_name)
            .await
            .map_err(provisioning)
            .context("bringing bridge up")?;
        self.host
            .assign_address(&alloc.bridge_name, alloc.bridge_address)
            .await
            .map_err(provisioning)
            .context("assigning bridge address")?;

        // Step 3: NAT
        self.host
            .add_masquerade(&alloc)
            .await
            .map_err(provisioning)
            .context("installing NAT rule")?;

        // Step 4: DHCP
        self.host
            .start_dhcp(&alloc)
            .await
            .map_err(provisioning)
            .context("starting DHCP server")?;
        self.dhcp_running = true;

        Ok(alloc.bridge_name)
    }

    /// Release everything `setup` created. Each step is attempted even if an
    /// earlier one failed; failures are logged only.
    pub async fn teardown(&mut self) {
        if !self.options.autoconfigure {
            return;
        }

        if let Some(alloc) = self.allocation.take() {
            info!(bridge = %alloc.bridge_name, "tearing down bridge network");

            if let Err(e) = self.host.remove_masquerade(&alloc.bridge_name).await {
                warn!(bridge = %alloc.bridge_name, error = %format!("{:#}", e), "failed to remove NAT rule");
            }

            if let Err(e) = self.host.delete_bridge(&alloc.bridge_name).await {
                warn!(bridge = %alloc.bridge_name, error = %format!("{:#}", e), "failed to delete bridge");
            }
        }

        if std::mem::take(&mut self.dhcp_running) {
            self.host.stop_dhcp().await;
        }
    }
}

fn provisioning(e: anyhow::Error) -> anyhow::Error {
    WorkerError::Provisioning(format!("{:#}", e)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::worker_error;
    use anyhow::bail;
    use std::sync::{Arc, Mutex};

    /// Records each host operation; the named one fails
    struct RecordingHost {
        ops: Arc<Mutex<Vec<&'static str>>>,
        fail: &'static str,
    }

    impl RecordingHost {
        fn record(&self, op: &'static str) -> Result<()> {
            self.ops.lock().unwrap().push(op);
            if op == self.fail {
                bail!("{} failed", op);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl HostNetwork for RecordingHost {
        async fn ensure_bridge(&mut self, _name: &str) -> Result<()> {
            self.record("ensure_bridge")
        }
        async fn set_link_up(&mut self, _name: &str) -> Result<()> {
            self.record("set_link_up")
        }
        async fn assign_address(&mut self, _name: &str, _address: Ipv4Addr) -> Result<()> {
            self.record("assign_address")
        }
        async fn add_masquerade(&mut self, _alloc: &BridgeAllocation) -> Result<()> {
            self.record("add_masquerade")
        }
        async fn remove_masquerade(&mut self, _bridge_name: &str) -> Result<()> {
            self.record("remove_masquerade")
        }
        async fn delete_bridge(&mut self, _name: &str) -> Result<()> {
            self.record("delete_bridge")
        }
        async fn start_dhcp(&mut self, _alloc: &BridgeAllocation) -> Result<()> {
            self.record("start_dhcp")
        }
        async fn stop_dhcp(&mut self) {
            let _ = self.record("stop_dhcp");
        }
    }

    fn recorded(fail: &'static str) -> (NetworkProvisioner, Arc<Mutex<Vec<&'static str>>>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let host = RecordingHost {
            ops: ops.clone(),
            fail,
        };
        let options = NetworkOptions {
            bridge_address: Some(Ipv4Addr::new(10, 77, 0, 1)),
            dhcp_range: Some("10.77.0.10,10.77.0.200".into()),
            ..Default::default()
        };
        let prov = NetworkProvisioner::with_host(options, "abcd1234".into(), Box::new(host));
        (prov, ops)
    }

    #[tokio::test]
    async fn test_teardown_continues_past_failed_nat_removal() {
        let (mut prov, ops) = recorded("remove_masquerade");
        assert_eq!(prov.setup().await.unwrap(), "brabcd1234");
        ops.lock().unwrap().clear();

        prov.teardown().await;
        assert_eq!(
            *ops.lock().unwrap(),
            vec!["remove_masquerade", "delete_bridge", "stop_dhcp"]
        );
        assert!(prov.allocation().is_none());

        // Everything was released, so a second teardown does nothing
        prov.teardown().await;
        assert_eq!(ops.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_setup_leaves_partial_state_for_teardown() {
        let (mut prov, ops) = recorded("add_masquerade");
        let err = prov.setup().await.unwrap_err();
        assert!(matches!(
            worker_error(&err),
            Some(WorkerError::Provisioning(_))
        ));
        assert!(prov.allocation().is_some());
        ops.lock().unwrap().clear();

        // No DHCP server was started, so none is stopped
        prov.teardown().await;
        assert_eq!(
            *ops.lock().unwrap(),
            vec!["remove_masquerade", "delete_bridge"]
        );
    }

    #[tokio::test]
    async fn test_manual_mode_requires_bridge() {
        let mut prov = NetworkProvisioner::new(
            NetworkOptions {
                autoconfigure: false,
                ..Default::default()
            },
            "abcd1234".into(),
        );
        let err = prov.setup().await.unwrap_err();
        assert!(matches!(
            worker_error(&err),
            Some(WorkerError::Provisioning(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_mode_uses_operator_bridge() {
        let mut prov = NetworkProvisioner::new(
            NetworkOptions {
                autoconfigure: false,
                bridge_name: Some("br-lab".into()),
                ..Default::default()
            },
            "abcd1234".into(),
        );
        assert_eq!(prov.setup().await.unwrap(), "br-lab");
        assert_eq!(prov.bridge_name(), Some("br-lab"));
        // Nothing was created so teardown has nothing to do
        prov.teardown().await;
        assert!(prov.allocation().is_none());
    }

    #[test]
    fn test_generated_bridge_name() {
        let prov = NetworkProvisioner::new(NetworkOptions::default(), "k3j9x0aa".into());
        assert_eq!(prov.pick_bridge_name(), "brk3j9x0aa");
        assert_eq!(prov.bridge_name(), None);
    }

    #[cfg(feature = "privileged-tests")]
    #[tokio::test]
    async fn test_setup_teardown_setup_does_not_collide() {
        let mut first = NetworkProvisioner::new(NetworkOptions::default(), "rigdt001".into());
        first.setup().await.expect("provision (requires root)");
        let first_alloc = first.allocation().cloned().unwrap();
        first.teardown().await;
        assert!(!bridge::bridge_exists(&first_alloc.bridge_name).await);

        let mut second = NetworkProvisioner::new(NetworkOptions::default(), "rigdt002".into());
        second.setup().await.unwrap();
        let second_alloc = second.allocation().cloned().unwrap();
        // The old block is free again, so it may be reused, but never while claimed
        assert!(subnet::host_addresses()
            .await
            .unwrap()
            .contains(&second_alloc.bridge_address));
        second.teardown().await;
    }
}
