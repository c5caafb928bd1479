//! Virtual device: a QEMU guest on an isolated bridge network.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{signals, CaptureAction, Diagnostics, Worker, WorkerState};
use crate::capture::{CaptureSource, FrameStream, ScreenCapture};
use crate::config::VirtualDeviceOptions;
use crate::error::WorkerError;
use crate::flash::{flash_disk, FlashPipeline, ProgressSender};
use crate::network::{NetworkProvisioner, NetworkRequest, PortAllocator};
use crate::process::{ManagedProcess, OutputMode, ProcessExit};
use crate::qemu::{args, build_args, hardware_acceleration_available, qmp, resolve_firmware};
use crate::qemu::{FirmwarePair, LaunchPlan};
use crate::storage::{BlockAssembler, MdadmRaid};
use crate::types::DeviceType;

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// A VM that dies this soon after spawn failed to start
const STARTUP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
struct VmPorts {
    vnc: u16,
    qmp: u16,
}

pub struct VirtualDeviceWorker {
    options: VirtualDeviceOptions,
    session_id: String,
    ip_forward_path: PathBuf,
    pipeline: FlashPipeline,
    network: NetworkProvisioner,
    capture: Option<ScreenCapture>,
    state: WorkerState,

    // Resolved at setup, or on first power-on
    firmware: Option<FirmwarePair>,

    // Present while the VM runs
    vm: Option<ManagedProcess>,
    ports: Option<VmPorts>,
    accelerated: bool,
}

impl VirtualDeviceWorker {
    pub fn new(options: VirtualDeviceOptions) -> Self {
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let network = NetworkProvisioner::new(options.network.clone(), session_id.clone());
        // The VNC port is only known at power-on
        let capture = options
            .screen_capture
            .then(|| ScreenCapture::new(options.capture_dir.clone(), CaptureSource::Vnc { port: 0 }));

        Self {
            firmware: options.firmware.clone(),
            options,
            session_id,
            ip_forward_path: PathBuf::from(IP_FORWARD_PATH),
            pipeline: FlashPipeline::default(),
            network,
            capture,
            state: WorkerState::default(),
            vm: None,
            ports: None,
            accelerated: false,
        }
    }

    /// Read the forwarding switch from elsewhere (tests)
    pub fn with_ip_forward_path(mut self, path: PathBuf) -> Self {
        self.ip_forward_path = path;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn firmware(&mut self) -> Result<FirmwarePair> {
        if let Some(firmware) = &self.firmware {
            return Ok(firmware.clone());
        }
        let firmware = resolve_firmware(self.options.architecture).await?;
        info!(
            code = %firmware.code.display(),
            vars = %firmware.vars.display(),
            "found UEFI firmware"
        );
        self.firmware = Some(firmware.clone());
        Ok(firmware)
    }

    fn running_ports(&self) -> Result<VmPorts> {
        match (&self.vm, self.ports) {
            (Some(vm), Some(ports)) if vm.is_running() => Ok(ports),
            _ => bail!("the virtual device is not powered on"),
        }
    }
}

/// Forwarding must be on for the guest's NAT to work
pub fn check_ip_forward(contents: &str) -> Result<()> {
    if contents.trim() != "1" {
        return Err(WorkerError::prerequisite(
            "Kernel IP forwarding required for virtualized device networking",
            "enable with 'sysctl -w net.ipv4.ip_forward=1'",
        )
        .into());
    }
    Ok(())
}

#[async_trait]
impl Worker for VirtualDeviceWorker {
    fn device_type(&self) -> DeviceType {
        DeviceType::Qemu
    }

    fn state(&self) -> &WorkerState {
        &self.state
    }

    async fn setup(&mut self) -> Result<()> {
        let forwarding = tokio::fs::read_to_string(&self.ip_forward_path)
            .await
            .with_context(|| format!("reading {}", self.ip_forward_path.display()))?;
        check_ip_forward(&forwarding)?;

        self.firmware().await?;
        info!(session = %self.session_id, arch = %self.options.architecture, "virtual device ready");
        Ok(())
    }

    async fn power_on(&mut self) -> Result<()> {
        if self.vm.as_ref().is_some_and(ManagedProcess::is_running) {
            info!("VM already running");
            return Ok(());
        }

        let firmware = self.firmware().await?;
        let ports = VmPorts {
            vnc: PortAllocator::resolve(&self.options.network.vnc)
                .await
                .context("allocating VNC port")?,
            qmp: PortAllocator::resolve(&self.options.network.qmp)
                .await
                .context("allocating QMP port")?,
        };

        let accelerated = hardware_acceleration_available(self.options.architecture);
        if !accelerated {
            warn!(arch = %self.options.architecture, "KVM unavailable, falling back to software emulation");
        }

        let plan = LaunchPlan {
            options: &self.options,
            firmware: &firmware,
            bridge: self.network.bridge_name(),
            vnc_port: ports.vnc,
            qmp_port: ports.qmp,
            accelerated,
        };
        let vm_args = build_args(&plan)?;

        let mut cmd = Command::new(args::binary(self.options.architecture));
        cmd.args(&vm_args);
        let output = if self.options.debug {
            OutputMode::Inherit
        } else {
            OutputMode::Log
        };

        info!(
            vnc_port = ports.vnc,
            qmp_port = ports.qmp,
            bridge = ?plan.bridge,
            accelerated,
            "starting VM"
        );
        let vm = ManagedProcess::spawn("qemu", cmd, output)?;

        // Readiness is not awaited, but a VM that dies at once never started
        tokio::select! {
            exit = vm.exited() => {
                bail!("VM exited during startup: {:?}", exit);
            }
            _ = tokio::time::sleep(STARTUP_GRACE) => {}
        }

        self.vm = Some(vm);
        self.ports = Some(ports);
        self.accelerated = accelerated;
        if let Some(capture) = &mut self.capture {
            capture.set_source(CaptureSource::Vnc { port: ports.vnc });
        }
        Ok(())
    }

    async fn power_off(&mut self) -> Result<()> {
        if let Some(mut vm) = self.vm.take() {
            vm.stop().await;
            info!("VM powered off");
        }
        self.ports = None;
        Ok(())
    }

    async fn flash(&mut self, image: &Path, progress: Option<ProgressSender>) -> Result<()> {
        self.power_off().await?;

        let raid = self
            .options
            .force_raid
            .then(|| MdadmRaid::new(self.session_id.clone()));
        let assembler = raid.as_ref().map(|r| r as &dyn BlockAssembler);

        info!(image = %image.display(), disk = %self.options.disk.display(), raid = self.options.force_raid, "flashing virtual disk");
        let report = flash_disk(
            &self.pipeline,
            image,
            &self.options.disk,
            self.options.disk_size,
            assembler,
            progress.as_ref(),
        )
        .await?;

        info!(bytes = report.bytes, sha256 = %report.sha256, "flash complete");
        Ok(())
    }

    async fn network(&mut self, request: &NetworkRequest) -> Result<()> {
        if request.wireless.is_some() {
            return Err(WorkerError::capability("qemu", "wireless network").into());
        }

        let bridge = self.network.setup().await?;
        self.state.network.wired = Some(bridge);
        Ok(())
    }

    async fn capture_screen(&mut self, action: CaptureAction) -> Result<Option<FrameStream>> {
        let running = self.running_ports().ok();
        let capture = self
            .capture
            .as_mut()
            .ok_or(WorkerError::capability("qemu", "captureScreen"))?;

        match action {
            CaptureAction::Start => {
                if running.is_none() {
                    bail!("power on the virtual device before capturing its screen");
                }
                Ok(Some(capture.start().await?))
            }
            CaptureAction::Stop => {
                capture.stop().await;
                Ok(None)
            }
        }
    }

    async fn diagnostics(&self) -> Result<Diagnostics> {
        let mut diag = Diagnostics::new();
        let running = self.vm.as_ref().is_some_and(ManagedProcess::is_running);
        diag.insert("running".into(), Value::Bool(running));
        diag.insert("accelerated".into(), Value::Bool(running && self.accelerated));

        if let Some(vm) = &self.vm {
            if let Some(pid) = vm.pid() {
                diag.insert("pid".into(), pid.into());
            }
            match vm.exit() {
                Some(ProcessExit::Exited(status)) => {
                    diag.insert("lastExit".into(), status.to_string().into());
                }
                Some(ProcessExit::WaitFailed(e)) => {
                    diag.insert("lastExit".into(), e.into());
                }
                _ => {}
            }
        }
        if let Some(ports) = self.ports {
            diag.insert("vncPort".into(), ports.vnc.into());
            diag.insert("qmpPort".into(), ports.qmp.into());
        }
        if let Some(bridge) = self.network.bridge_name() {
            diag.insert("bridge".into(), bridge.into());
        }
        Ok(diag)
    }

    async fn keyboard_press(&mut self, key: &str) -> Result<()> {
        let ports = self.running_ports()?;
        qmp::send_key(ports.qmp, key).await
    }

    async fn teardown(&mut self, signal: Option<Signal>) -> Result<()> {
        info!(session = %self.session_id, "tearing down virtual device");

        if let Err(e) = self.power_off().await {
            warn!(error = %format!("{:#}", e), "failed to power off VM");
        }
        if let Some(capture) = &mut self.capture {
            capture.stop().await;
        }
        self.network.teardown().await;
        self.state = WorkerState::default();

        signals::reraise(signal);
        Ok(())
    }
}
