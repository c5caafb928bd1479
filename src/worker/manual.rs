//! Manual worker: an operator does everything by hand.

use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::path::Path;
use tracing::info;

use super::{signals, CaptureAction, Diagnostics, Worker, WorkerState};
use crate::capture::FrameStream;
use crate::error::WorkerError;
use crate::flash::ProgressSender;
use crate::network::NetworkRequest;
use crate::types::DeviceType;

#[derive(Default)]
pub struct ManualWorker {
    state: WorkerState,
}

impl ManualWorker {
    pub fn new() -> Self {
        info!("Using manual worker: manual flashing of DUT is required");
        Self::default()
    }
}

#[async_trait]
impl Worker for ManualWorker {
    fn device_type(&self) -> DeviceType {
        DeviceType::Manual
    }

    fn state(&self) -> &WorkerState {
        &self.state
    }

    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn power_on(&mut self) -> Result<()> {
        info!("[Manual worker] Power on DUT");
        Ok(())
    }

    async fn power_off(&mut self) -> Result<()> {
        info!("[Manual worker] Power off DUT");
        Ok(())
    }

    async fn flash(&mut self, image: &Path, _progress: Option<ProgressSender>) -> Result<()> {
        info!(
            "[Manual worker] Manually flash DUT now, with image at {}",
            image.display()
        );
        Ok(())
    }

    async fn network(&mut self, request: &NetworkRequest) -> Result<()> {
        if let Some(wireless) = &request.wireless {
            info!(
                "[Manual worker] Test suite expects DUT to be connected to Wifi network, SSID: {}, PSK: {}",
                wireless.ssid,
                wireless.psk.as_deref().unwrap_or("")
            );
        }
        if request.wired.is_some() {
            info!("[Manual worker] Test suite expects DUT to be connected to wired network");
        }
        Ok(())
    }

    async fn capture_screen(&mut self, _action: CaptureAction) -> Result<Option<FrameStream>> {
        Err(WorkerError::capability("manual", "captureScreen").into())
    }

    async fn diagnostics(&self) -> Result<Diagnostics> {
        Ok(Diagnostics::new())
    }

    async fn teardown(&mut self, signal: Option<Signal>) -> Result<()> {
        info!("[Manual worker] Tear down DUT");
        signals::reraise(signal);
        Ok(())
    }
}
