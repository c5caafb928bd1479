use anyhow::Result;
use tokio::process::Command;

use crate::cli::PreflightArgs;
use crate::qemu::args::binary;
use crate::qemu::firmware::{default_candidates, find_firmware};
use crate::types::Architecture;

pub async fn cmd_preflight(args: PreflightArgs) -> Result<()> {
    let arch: Architecture = args.arch.into();
    println!("🔍 Checking rig host requirements ({})...\n", arch);

    let mut all_ok = true;

    all_ok &= check_command(&binary(arch), "--version", "QEMU").await;
    all_ok &= check_command("dnsmasq", "--version", "dnsmasq").await;
    all_ok &= check_command("iptables-legacy", "--version", "iptables-legacy").await;
    all_ok &= check_command("ip", "-V", "iproute2").await;
    all_ok &= check_command("losetup", "--version", "losetup").await;
    all_ok &= check_command("mdadm", "--version", "mdadm").await;
    all_ok &= check_command("gst-launch-1.0", "--version", "GStreamer").await;
    all_ok &= check_kvm().await;
    all_ok &= check_ip_forward().await;
    all_ok &= check_firmware(arch).await;

    println!();
    if all_ok {
        println!("✅ All checks passed! This host can run a virtual device.");
    } else {
        println!("⚠️  Some checks failed; virtual devices may not work on this host.");
    }

    Ok(())
}

async fn check_command(cmd: &str, arg: &str, name: &str) -> bool {
    print!("  {} ... ", name);

    match Command::new(cmd).arg(arg).output().await {
        Ok(output) if output.status.success() => {
            // mdadm prints its version on stderr
            let text = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).into_owned()
            } else {
                String::from_utf8_lossy(&output.stdout).into_owned()
            };
            let version_line = text.lines().next().unwrap_or("installed");
            println!("✓ {}", version_line.trim());
            true
        }
        _ => {
            println!("✗ not found");
            false
        }
    }
}

async fn check_kvm() -> bool {
    print!("  KVM support ... ");

    if tokio::fs::metadata("/dev/kvm").await.is_ok() {
        println!("✓ available");
        true
    } else {
        println!("✗ /dev/kvm not found (software emulation will be used)");
        false
    }
}

async fn check_ip_forward() -> bool {
    print!("  IP forwarding ... ");

    match tokio::fs::read_to_string("/proc/sys/net/ipv4/ip_forward").await {
        Ok(value) if value.trim() == "1" => {
            println!("✓ enabled");
            true
        }
        _ => {
            println!("✗ disabled (enable with 'sysctl -w net.ipv4.ip_forward=1')");
            false
        }
    }
}

async fn check_firmware(arch: Architecture) -> bool {
    print!("  UEFI firmware ... ");

    match find_firmware(&default_candidates(arch)).await {
        Some(pair) => {
            println!("✓ {}", pair.code.display());
            true
        }
        None => {
            println!("✗ not found (install OVMF/AAVMF)");
            false
        }
    }
}
