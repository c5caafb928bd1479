//! The device-under-test abstraction.
//!
//! Every backend presents the same [`Worker`] contract. The variant is
//! picked once at startup from the configured [`DeviceType`] and never
//! swapped while the daemon runs.

pub mod autokit;
pub mod contract;
pub mod manual;
pub mod qemu;
pub mod rig;
pub mod signals;
pub mod testbot;

use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::capture::FrameStream;
use crate::config::DaemonConfig;
use crate::error::WorkerError;
use crate::flash::ProgressSender;
use crate::network::{NetworkRequest, NetworkState};
use crate::types::DeviceType;

pub use autokit::AutomationRigWorker;
pub use contract::DeviceContract;
pub use manual::ManualWorker;
pub use qemu::VirtualDeviceWorker;
pub use rig::{RigCli, RigSdk};
pub use testbot::PhysicalRigWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureAction {
    Start,
    Stop,
}

/// State a worker exposes to callers; only the worker mutates it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    pub network: NetworkState,
}

/// Point-in-time health metrics
pub type Diagnostics = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait Worker: Send + Sync {
    fn device_type(&self) -> DeviceType;

    fn state(&self) -> &WorkerState;

    /// One-time preparation; an error here is fatal to the daemon
    async fn setup(&mut self) -> Result<()>;

    async fn power_on(&mut self) -> Result<()>;

    /// Succeeds even when the device was never powered on
    async fn power_off(&mut self) -> Result<()>;

    /// Write `image` to the device's storage, powering it off first
    async fn flash(&mut self, image: &Path, progress: Option<ProgressSender>) -> Result<()>;

    async fn network(&mut self, request: &NetworkRequest) -> Result<()>;

    /// `Start` yields the frame stream, `Stop` yields nothing
    async fn capture_screen(&mut self, action: CaptureAction) -> Result<Option<FrameStream>>;

    async fn diagnostics(&self) -> Result<Diagnostics>;

    async fn keyboard_press(&mut self, _key: &str) -> Result<()> {
        Err(WorkerError::capability(self.device_type().as_str(), "keyboardPress").into())
    }

    /// Release everything acquired since `setup`.
    ///
    /// Safe to repeat. Each reclaim step is attempted even if an earlier one
    /// failed. With a signal, the signal is re-raised once cleanup is done.
    async fn teardown(&mut self, signal: Option<Signal>) -> Result<()>;
}

/// The single worker, shared by the session controller and the handlers
pub type SharedWorker = Arc<Mutex<Box<dyn Worker>>>;

pub fn shared(worker: Box<dyn Worker>) -> SharedWorker {
    Arc::new(Mutex::new(worker))
}

/// Construct the worker for the configured device type
pub fn build_worker(config: &DaemonConfig) -> Box<dyn Worker> {
    match config.device_type {
        DeviceType::Qemu => Box::new(VirtualDeviceWorker::new(config.virtual_device.clone())),
        DeviceType::TestbotHat => {
            let sdk = RigCli::new(&config.testbot);
            Box::new(PhysicalRigWorker::new(config.testbot.clone(), Box::new(sdk)))
        }
        DeviceType::Autokit => {
            let sdk = RigCli::new(&config.autokit);
            Box::new(AutomationRigWorker::new(
                config.autokit.capture_dir.clone(),
                Box::new(sdk),
            ))
        }
        DeviceType::Manual => Box::new(ManualWorker::new()),
    }
}
