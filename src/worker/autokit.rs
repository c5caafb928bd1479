//! Automation rig: power, SD mux, network and video behind one kit.

use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::rig::RigSdk;
use super::{signals, CaptureAction, Diagnostics, Worker, WorkerState};
use crate::capture::{watch_frames, FrameStream};
use crate::flash::ProgressSender;
use crate::network::NetworkRequest;
use crate::types::DeviceType;

pub struct AutomationRigWorker {
    sdk: Box<dyn RigSdk>,
    /// Where the kit's video grabber drops frames
    capture_dir: PathBuf,
    state: WorkerState,
}

impl AutomationRigWorker {
    pub fn new(capture_dir: PathBuf, sdk: Box<dyn RigSdk>) -> Self {
        Self {
            sdk,
            capture_dir,
            state: WorkerState::default(),
        }
    }
}

#[async_trait]
impl Worker for AutomationRigWorker {
    fn device_type(&self) -> DeviceType {
        DeviceType::Autokit
    }

    fn state(&self) -> &WorkerState {
        &self.state
    }

    async fn setup(&mut self) -> Result<()> {
        self.sdk.setup().await
    }

    async fn power_on(&mut self) -> Result<()> {
        info!("powering on DUT");
        self.sdk.power(true).await
    }

    async fn power_off(&mut self) -> Result<()> {
        info!("powering off DUT");
        self.sdk.power(false).await
    }

    async fn flash(&mut self, image: &Path, _progress: Option<ProgressSender>) -> Result<()> {
        self.power_off().await?;
        info!(image = %image.display(), "flashing DUT");
        self.sdk.flash(image).await?;
        info!("flashing completed");
        Ok(())
    }

    async fn network(&mut self, request: &NetworkRequest) -> Result<()> {
        if let Some(wireless) = &request.wireless {
            let conn = self.sdk.add_wireless(None, wireless).await?;
            self.state.network.wireless = Some(conn);
        }
        if let Some(wired) = &request.wired {
            let conn = self.sdk.add_wired(None, wired.nat).await?;
            self.state.network.wired = Some(conn);
        }
        Ok(())
    }

    async fn capture_screen(&mut self, action: CaptureAction) -> Result<Option<FrameStream>> {
        match action {
            CaptureAction::Start => {
                self.sdk.video(true).await?;
                Ok(Some(watch_frames(self.capture_dir.clone()).await?))
            }
            CaptureAction::Stop => {
                self.sdk.video(false).await?;
                Ok(None)
            }
        }
    }

    async fn diagnostics(&self) -> Result<Diagnostics> {
        Ok(Diagnostics::new())
    }

    async fn keyboard_press(&mut self, key: &str) -> Result<()> {
        self.sdk.keyboard(key).await
    }

    async fn teardown(&mut self, signal: Option<Signal>) -> Result<()> {
        info!("tearing down automation rig");
        if let Err(e) = self.sdk.teardown(false).await {
            warn!(error = %format!("{:#}", e), "rig teardown failed");
        }
        self.state = WorkerState::default();

        signals::reraise(signal);
        Ok(())
    }
}
