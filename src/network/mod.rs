pub mod bridge;
pub mod dhcp;
pub mod nat;
pub mod ports;
pub mod provisioner;
pub mod resolver;
pub mod subnet;
pub mod types;

pub use ports::PortAllocator;
pub use provisioner::NetworkProvisioner;
pub use resolver::{AddressLookup, LocalTargetResolver};
pub use types::{BridgeAllocation, ConnectionDescriptor, NetworkRequest, NetworkState};
