//! Runtime configuration the daemon is assembled from.
//!
//! Built once at startup (see `cli::types`) and handed to the worker
//! constructors; nothing here changes afterwards.

use anyhow::{bail, Context, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::WorkdirPaths;
use crate::qemu::FirmwarePair;
use crate::types::{Architecture, DeviceType};

/// A TCP port that is either pinned by the operator or picked from a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChoice {
    pub pinned: Option<u16>,
    pub min: u16,
    pub max: u16,
}

impl PortChoice {
    pub fn validate(&self, what: &str) -> Result<()> {
        if self.min > self.max {
            bail!("{} port range {}-{} is empty", what, self.min, self.max);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NetworkOptions {
    pub autoconfigure: bool,
    pub bridge_name: Option<String>,
    pub bridge_address: Option<Ipv4Addr>,
    pub dhcp_range: Option<String>,
    pub vnc: PortChoice,
    pub qmp: PortChoice,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            autoconfigure: true,
            bridge_name: None,
            bridge_address: None,
            dhcp_range: None,
            vnc: PortChoice {
                pinned: None,
                min: 5900,
                max: 5999,
            },
            qmp: PortChoice {
                pinned: None,
                min: 5000,
                max: 5899,
            },
        }
    }
}

impl NetworkOptions {
    pub fn validate(&self) -> Result<()> {
        if self.bridge_address.is_some() && self.dhcp_range.is_none() {
            bail!("a bridge address was given without a DHCP range");
        }
        if !self.autoconfigure && self.bridge_name.is_none() {
            bail!("network autoconfiguration is disabled but no bridge name was supplied");
        }
        self.vnc.validate("VNC")?;
        self.qmp.validate("QMP")
    }
}

#[derive(Debug, Clone)]
pub struct VirtualDeviceOptions {
    pub architecture: Architecture,
    pub cpus: u32,
    /// QEMU memory argument, e.g. "2G"
    pub memory: String,
    pub debug: bool,
    pub force_raid: bool,
    pub disk: PathBuf,
    pub disk_size: u64,
    /// Explicit firmware; probed at setup when absent
    pub firmware: Option<FirmwarePair>,
    pub network: NetworkOptions,
    pub screen_capture: bool,
    pub serial_log: PathBuf,
    pub capture_dir: PathBuf,
}

impl VirtualDeviceOptions {
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            bail!("the virtual device needs at least one CPU");
        }
        parse_size(&self.memory).with_context(|| format!("invalid memory size '{}'", self.memory))?;
        self.network.validate()
    }
}

/// Options for a rig reached through its bridge binary
#[derive(Debug, Clone)]
pub struct RigOptions {
    pub program: String,
    /// Extra environment passed to every bridge invocation
    pub env: Vec<(String, String)>,
    pub wired_interface: Option<String>,
    pub wireless_interface: Option<String>,
    pub screen_capture: bool,
    pub video_device: PathBuf,
    pub serial_log: PathBuf,
    pub capture_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SerialOptions {
    pub path: PathBuf,
    pub baud_rate: u32,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub device_type: DeviceType,
    pub paths: WorkdirPaths,
    pub lock_path: Option<PathBuf>,
    pub heartbeat_timeout: Duration,
    pub flash_timeout_tries: u32,
    pub serial: SerialOptions,
    pub serial_log: PathBuf,
    pub device_id: String,
    pub device_tags: String,
    pub virtual_device: VirtualDeviceOptions,
    pub testbot: RigOptions,
    pub autokit: RigOptions,
}

impl DaemonConfig {
    /// Only the options of the selected device type are checked.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout.is_zero() {
            bail!("heartbeat timeout must be positive");
        }
        if self.device_type == DeviceType::Qemu {
            self.virtual_device
                .validate()
                .context("invalid virtual device configuration")?;
        }
        Ok(())
    }
}

/// Parse size strings like "8G", "512M", "1024K", or plain bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty size string");
    }

    let (num_str, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('T') => (&s[..s.len() - 1], 1u64 << 40),
        Some('G') => (&s[..s.len() - 1], 1u64 << 30),
        Some('M') => (&s[..s.len() - 1], 1u64 << 20),
        Some('K') => (&s[..s.len() - 1], 1u64 << 10),
        _ => (s, 1u64),
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("parsing size number '{}'", num_str))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("size '{}' overflows", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8G").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2k").unwrap(), 2048);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_address_requires_range() {
        let opts = NetworkOptions {
            bridge_address: Some(Ipv4Addr::new(192, 168, 7, 1)),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = NetworkOptions {
            bridge_address: Some(Ipv4Addr::new(192, 168, 7, 1)),
            dhcp_range: Some("192.168.7.2,192.168.7.254".into()),
            ..Default::default()
        };
        opts.validate().unwrap();
    }

    #[test]
    fn test_manual_networking_requires_bridge() {
        let opts = NetworkOptions {
            autoconfigure: false,
            ..Default::default()
        };
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("no bridge name"));
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let choice = PortChoice {
            pinned: None,
            min: 6000,
            max: 5999,
        };
        assert!(choice.validate("VNC").is_err());
    }
}
