//! QEMU command-line assembly.

use anyhow::{bail, Result};
use std::path::Path;

use super::FirmwarePair;
use crate::config::VirtualDeviceOptions;
use crate::types::Architecture;

/// First TCP port of VNC display :0
pub const VNC_BASE_PORT: u16 = 5900;

const KVM_DEVICE: &str = "/dev/kvm";

/// Everything that varies between power-ons of the same device
#[derive(Debug, Clone)]
pub struct LaunchPlan<'a> {
    pub options: &'a VirtualDeviceOptions,
    pub firmware: &'a FirmwarePair,
    pub bridge: Option<&'a str>,
    pub vnc_port: u16,
    pub qmp_port: u16,
    pub accelerated: bool,
}

pub fn binary(arch: Architecture) -> String {
    format!("qemu-system-{}", arch)
}

/// VNC display index for a TCP port; QEMU only takes the former
pub fn vnc_display(port: u16) -> Result<u16> {
    match port.checked_sub(VNC_BASE_PORT) {
        Some(display) => Ok(display),
        None => bail!("VNC port {} is below {}", port, VNC_BASE_PORT),
    }
}

/// KVM is used only when the device exists and the guest runs natively
pub fn acceleration_supported(kvm_present: bool, arch: Architecture, host_arch: &str) -> bool {
    kvm_present && arch.matches_host(host_arch)
}

pub fn hardware_acceleration_available(arch: Architecture) -> bool {
    acceleration_supported(
        Path::new(KVM_DEVICE).exists(),
        arch,
        std::env::consts::ARCH,
    )
}

pub fn build_args(plan: &LaunchPlan<'_>) -> Result<Vec<String>> {
    let opts = plan.options;
    let mut args: Vec<String> = vec![
        "-nographic".into(),
        "-m".into(),
        opts.memory.clone(),
        "-smp".into(),
        opts.cpus.to_string(),
        "-drive".into(),
        format!("format=raw,file={},if=virtio", opts.disk.display()),
    ];

    if !opts.debug {
        args.push("-serial".into());
        args.push(format!("file:{}", opts.serial_log.display()));
    }

    if plan.accelerated {
        args.push("-enable-kvm".into());
    }

    match opts.architecture {
        Architecture::X86_64 => args.extend(["-M", "q35", "-cpu", "max"].map(String::from)),
        Architecture::Aarch64 => {
            args.extend(["-M", "virt", "-cpu", "cortex-a72"].map(String::from))
        }
    }

    if let Some(bridge) = plan.bridge {
        args.push("-net".into());
        args.push("nic,model=e1000".into());
        args.push("-net".into());
        args.push(format!("bridge,br={}", bridge));
    }

    match opts.architecture {
        Architecture::X86_64 => {
            args.extend(
                [
                    "-global",
                    "driver=cfi.pflash01,property=secure,value=on",
                    "-global",
                    "ICH9-LPC.disable_s3=1",
                ]
                .map(String::from),
            );
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,format=raw,unit=0,file={},readonly=on",
                plan.firmware.code.display()
            ));
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,format=raw,unit=1,file={},readonly=on",
                plan.firmware.vars.display()
            ));
        }
        Architecture::Aarch64 => {
            args.push("-bios".into());
            args.push(plan.firmware.code.display().to_string());
        }
    }

    args.push("-qmp".into());
    args.push(format!("tcp:localhost:{},server,nowait", plan.qmp_port));

    if opts.screen_capture {
        args.push("-vnc".into());
        args.push(format!(":{}", vnc_display(plan.vnc_port)?));
        if opts.architecture == Architecture::Aarch64 {
            args.push("-device".into());
            args.push("virtio-gpu-pci".into());
        }
    }

    Ok(args)
}
