use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::args::{ArchOpt, RigArgs, ServeArgs, WorkerTypeOpt};
use crate::config::{
    parse_size, DaemonConfig, NetworkOptions, PortChoice, RigOptions, SerialOptions,
    VirtualDeviceOptions,
};
use crate::paths::{lease_lock_path, WorkdirPaths};
use crate::qemu::FirmwarePair;
use crate::types::{Architecture, DeviceType};

impl From<WorkerTypeOpt> for DeviceType {
    fn from(t: WorkerTypeOpt) -> Self {
        match t {
            WorkerTypeOpt::TestbotHat => DeviceType::TestbotHat,
            WorkerTypeOpt::Qemu => DeviceType::Qemu,
            WorkerTypeOpt::Autokit => DeviceType::Autokit,
            WorkerTypeOpt::Manual => DeviceType::Manual,
        }
    }
}

impl From<ArchOpt> for Architecture {
    fn from(a: ArchOpt) -> Self {
        match a {
            ArchOpt::X86_64 => Architecture::X86_64,
            ArchOpt::Aarch64 => Architecture::Aarch64,
        }
    }
}

fn autokit_env(rig: &RigArgs) -> Vec<(String, String)> {
    let mut env = vec![
        ("POWER".to_string(), rig.power.clone()),
        ("SD_MUX".to_string(), rig.sd_mux.clone()),
        ("NETWORK".to_string(), rig.network.clone()),
        ("VIDEO".to_string(), rig.video.clone()),
        ("SERIAL".to_string(), rig.serial.clone()),
        ("USB_BOOT_PORT".to_string(), rig.usb_boot_port.clone()),
        ("DIGITAL_RELAY".to_string(), rig.digital_relay.clone()),
    ];
    if let Some(dut) = &rig.testbot_dut_type {
        env.push(("TESTBOT_DUT_TYPE".to_string(), dut.clone()));
    }
    env
}

impl TryFrom<ServeArgs> for DaemonConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let paths = WorkdirPaths::from_config(&args.workdir);
        let serial_log = PathBuf::from(shellexpand::tilde(&args.serial_log).as_ref());
        let capture_dir = paths.capture_dir();
        let q = &args.qemu;

        let firmware = match (&q.qemu_firmware_code, &q.qemu_firmware_vars) {
            (Some(code), Some(vars)) => Some(FirmwarePair::new(code, vars)),
            _ => None,
        };

        let virtual_device = VirtualDeviceOptions {
            architecture: q.qemu_arch.into(),
            cpus: q.qemu_cpus,
            memory: q.qemu_memory.clone(),
            debug: q.qemu_debug,
            force_raid: q.qemu_force_raid,
            disk: q
                .qemu_disk
                .as_deref()
                .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
                .unwrap_or_else(|| paths.vm_disk()),
            disk_size: parse_size(&q.qemu_disk_size)
                .with_context(|| format!("invalid disk size '{}'", q.qemu_disk_size))?,
            firmware,
            network: NetworkOptions {
                autoconfigure: q.qemu_network_autoconfigure,
                bridge_name: q.qemu_bridge_name.clone(),
                bridge_address: q.qemu_bridge_address,
                dhcp_range: q.qemu_dhcp_range.clone(),
                vnc: PortChoice {
                    pinned: q.qemu_vnc_port,
                    min: q.qemu_vnc_min_port,
                    max: q.qemu_vnc_max_port,
                },
                qmp: PortChoice {
                    pinned: q.qemu_qmp_port,
                    min: q.qemu_qmp_min_port,
                    max: q.qemu_qmp_max_port,
                },
            },
            screen_capture: args.screen_capture,
            serial_log: serial_log.clone(),
            capture_dir: capture_dir.clone(),
        };

        let testbot = RigOptions {
            program: args.rig.testbot_cli.clone(),
            env: args
                .rig
                .testbot_dut_type
                .iter()
                .map(|dut| ("TESTBOT_DUT_TYPE".to_string(), dut.clone()))
                .collect(),
            wired_interface: Some(args.wired_interface.clone()),
            wireless_interface: Some(args.wireless_interface.clone()),
            screen_capture: args.screen_capture,
            video_device: PathBuf::from(&args.video_device),
            serial_log: serial_log.clone(),
            capture_dir: capture_dir.clone(),
        };

        let autokit = RigOptions {
            program: args.rig.autokit_cli.clone(),
            env: autokit_env(&args.rig),
            wired_interface: None,
            wireless_interface: None,
            screen_capture: args.screen_capture,
            video_device: PathBuf::from(&args.video_device),
            serial_log: serial_log.clone(),
            capture_dir,
        };

        let config = DaemonConfig {
            port: args.port,
            device_type: args.worker_type.into(),
            lock_path: args.lock_path.as_deref().map(lease_lock_path),
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
            flash_timeout_tries: args.flash_timeout_tries,
            serial: SerialOptions {
                path: PathBuf::from(&args.serial_path),
                baud_rate: args.baud_rate,
            },
            serial_log,
            device_id: args
                .device_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            device_tags: args.device_tags,
            virtual_device,
            testbot,
            autokit,
            paths,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["rigd", "serve"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().cmd {
            Commands::Serve(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_worker_type_conversion() {
        assert_eq!(DeviceType::from(WorkerTypeOpt::TestbotHat), DeviceType::TestbotHat);
        assert_eq!(DeviceType::from(WorkerTypeOpt::Qemu), DeviceType::Qemu);
        assert_eq!(Architecture::from(ArchOpt::Aarch64), Architecture::Aarch64);
    }

    #[test]
    fn test_qemu_config_from_flags() {
        let args = serve_args(&[
            "--worker-type",
            "qemu",
            "--workdir",
            "/srv/rig",
            "--qemu-force-raid",
            "1",
            "--qemu-vnc-port",
            "5905",
            "--lock-path",
            "/tmp/balena/updates.lock",
        ]);
        let config = DaemonConfig::try_from(args).unwrap();

        assert_eq!(config.device_type, DeviceType::Qemu);
        assert!(config.virtual_device.force_raid);
        assert_eq!(config.virtual_device.disk, PathBuf::from("/srv/rig/dut-disk.img"));
        assert_eq!(config.virtual_device.disk_size, 8 << 30);
        assert_eq!(config.virtual_device.network.vnc.pinned, Some(5905));
        assert_eq!(config.lock_path, Some(PathBuf::from("/tmp/balena/updates.lock")));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_address_without_range_rejected_for_qemu() {
        let args = serve_args(&[
            "--worker-type",
            "qemu",
            "--qemu-bridge-address",
            "192.168.50.1",
        ]);
        assert!(DaemonConfig::try_from(args).is_err());
    }

    #[test]
    fn test_autokit_env_passthrough() {
        let args = serve_args(&["--worker-type", "autokit", "--autokit-power", "usbRelay"]);
        let config = DaemonConfig::try_from(args).unwrap();
        assert!(config
            .autokit
            .env
            .contains(&("POWER".to_string(), "usbRelay".to_string())));
        assert!(config
            .autokit
            .env
            .contains(&("USB_BOOT_PORT".to_string(), "4".to_string())));
    }
}
