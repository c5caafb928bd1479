//! Physical rig: a board behind a relay/flashing HAT.

use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::path::Path;
use tracing::{info, warn};

use super::rig::{NetworkKind, RigSdk};
use super::{signals, CaptureAction, Diagnostics, Worker, WorkerState};
use crate::capture::{CaptureSource, FrameStream, ScreenCapture};
use crate::config::RigOptions;
use crate::error::WorkerError;
use crate::flash::ProgressSender;
use crate::network::NetworkRequest;
use crate::process::ManagedProcess;
use crate::types::DeviceType;

const WORKER: &str = "testbot_hat";

pub struct PhysicalRigWorker {
    options: RigOptions,
    sdk: Box<dyn RigSdk>,
    capture: Option<ScreenCapture>,
    serial: Option<ManagedProcess>,
    state: WorkerState,
}

impl PhysicalRigWorker {
    pub fn new(options: RigOptions, sdk: Box<dyn RigSdk>) -> Self {
        let capture = options.screen_capture.then(|| {
            ScreenCapture::new(
                options.capture_dir.clone(),
                CaptureSource::Video {
                    device: options.video_device.clone(),
                },
            )
        });
        Self {
            options,
            sdk,
            capture,
            serial: None,
            state: WorkerState::default(),
        }
    }

    fn network_configured(&self) -> bool {
        self.options.wired_interface.is_some() || self.options.wireless_interface.is_some()
    }

    async fn close_serial(&mut self) {
        if let Some(mut serial) = self.serial.take() {
            serial.stop().await;
        }
    }
}

#[async_trait]
impl Worker for PhysicalRigWorker {
    fn device_type(&self) -> DeviceType {
        DeviceType::TestbotHat
    }

    fn state(&self) -> &WorkerState {
        &self.state
    }

    async fn setup(&mut self) -> Result<()> {
        self.sdk.setup().await?;
        info!("physical rig ready");
        Ok(())
    }

    async fn power_on(&mut self) -> Result<()> {
        if self.serial.is_none() {
            match self.sdk.open_serial(&self.options.serial_log).await {
                Ok(serial) => self.serial = serial,
                Err(e) => warn!(error = %format!("{:#}", e), "DUT serial capture unavailable"),
            }
        }

        info!("powering on DUT");
        self.sdk.power(true).await?;

        if let Ok(diag) = self.sdk.diagnostics().await {
            if let Some(vout) = diag.get("vout") {
                info!(vout = %vout, "DUT powered");
            }
        }
        Ok(())
    }

    async fn power_off(&mut self) -> Result<()> {
        info!("powering off DUT");
        self.sdk.power(false).await?;
        self.close_serial().await;
        Ok(())
    }

    async fn flash(&mut self, image: &Path, _progress: Option<ProgressSender>) -> Result<()> {
        self.power_off().await?;
        info!(image = %image.display(), "flashing DUT");
        self.sdk.flash(image).await?;
        info!("flashing completed");
        Ok(())
    }

    async fn network(&mut self, request: &NetworkRequest) -> Result<()> {
        if !self.network_configured() {
            return Err(WorkerError::capability(WORKER, "network").into());
        }

        match &request.wireless {
            Some(wireless) => {
                info!(ssid = %wireless.ssid, "adding wireless connection");
                let conn = self
                    .sdk
                    .add_wireless(self.options.wireless_interface.as_deref(), wireless)
                    .await?;
                self.state.network.wireless = Some(conn);
            }
            None => {
                self.sdk.remove_network(NetworkKind::Wireless).await?;
                self.state.network.wireless = None;
            }
        }

        match &request.wired {
            Some(wired) => {
                info!(nat = wired.nat, "adding wired connection");
                let conn = self
                    .sdk
                    .add_wired(self.options.wired_interface.as_deref(), wired.nat)
                    .await?;
                self.state.network.wired = Some(conn);
            }
            None => {
                self.sdk.remove_network(NetworkKind::Wired).await?;
                self.state.network.wired = None;
            }
        }
        Ok(())
    }

    async fn capture_screen(&mut self, action: CaptureAction) -> Result<Option<FrameStream>> {
        let capture = self
            .capture
            .as_mut()
            .ok_or(WorkerError::capability(WORKER, "captureScreen"))?;
        match action {
            CaptureAction::Start => Ok(Some(capture.start().await?)),
            CaptureAction::Stop => {
                capture.stop().await;
                Ok(None)
            }
        }
    }

    async fn diagnostics(&self) -> Result<Diagnostics> {
        self.sdk.diagnostics().await
    }

    async fn teardown(&mut self, signal: Option<Signal>) -> Result<()> {
        info!("tearing down physical rig");
        let hard = matches!(signal, Some(Signal::SIGTERM) | Some(Signal::SIGINT));

        if let Err(e) = self.sdk.teardown(hard).await {
            warn!(error = %format!("{:#}", e), "rig teardown failed");
        }
        if let Some(capture) = &mut self.capture {
            capture.stop().await;
        }
        if self.network_configured() {
            for kind in [NetworkKind::Wireless, NetworkKind::Wired] {
                if let Err(e) = self.sdk.remove_network(kind).await {
                    warn!(network = kind.as_str(), error = %format!("{:#}", e), "failed to remove connection");
                }
            }
        }
        self.close_serial().await;
        self.state = WorkerState::default();

        signals::reraise(signal);
        Ok(())
    }
}
