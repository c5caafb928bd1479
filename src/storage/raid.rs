//! Single-disk RAID-1 over a loop device.
//!
//! Flashing tools expect a real block device; a loop device over the sparse
//! disk file with an md array on top gives them one of the right size.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::utils::{run_checked, run_with_stdin};

/// Devices built on top of a backing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledDevice {
    /// Block device to write to
    pub device: PathBuf,
    pub loop_device: String,
}

/// Builds and removes the block-device stack used while flashing
#[async_trait::async_trait]
pub trait BlockAssembler: Send + Sync {
    async fn assemble(&self, backing: &Path) -> Result<AssembledDevice>;

    /// Stop the array, then detach the loop device. Both are attempted.
    async fn disassemble(&self, device: AssembledDevice) -> Result<()>;
}

/// `losetup` + `mdadm` implementation
pub struct MdadmRaid {
    array_name: String,
}

impl MdadmRaid {
    pub fn new(array_name: impl Into<String>) -> Self {
        Self {
            array_name: array_name.into(),
        }
    }

    fn array_path(&self) -> PathBuf {
        PathBuf::from("/dev/md").join(&self.array_name)
    }
}

#[async_trait::async_trait]
impl BlockAssembler for MdadmRaid {
    async fn assemble(&self, backing: &Path) -> Result<AssembledDevice> {
        let backing_str = backing.to_string_lossy();
        let output = run_checked("losetup", &["-fP", "--show", &backing_str])
            .await
            .context("attaching loop device")?;
        let loop_device = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let array = self.array_path();
        let array_str = array.to_string_lossy();
        // mdadm asks for confirmation about the 0.90 metadata format
        let created = run_with_stdin(
            "mdadm",
            &[
                "--create",
                "--verbose",
                "--level=1",
                "--raid-devices=1",
                "--metadata=0.90",
                "--force",
                &array_str,
                &loop_device,
            ],
            b"y\ny\ny\n",
        )
        .await;

        if let Err(e) = created {
            if let Err(detach) = run_checked("losetup", &["-d", &loop_device]).await {
                warn!(loop_device = %loop_device, error = %detach, "failed to detach loop device");
            }
            return Err(e).context("creating RAID-1 array");
        }

        info!(array = %array.display(), loop_device = %loop_device, "RAID-1 array assembled");
        Ok(AssembledDevice {
            device: array,
            loop_device,
        })
    }

    async fn disassemble(&self, device: AssembledDevice) -> Result<()> {
        let array = device.device.to_string_lossy().to_string();

        let stopped = run_checked("mdadm", &["--stop", &array])
            .await
            .context("stopping RAID array");
        if let Err(e) = &stopped {
            warn!(array = %array, error = %format!("{:#}", e), "failed to stop RAID array");
        }

        let detached = run_checked("losetup", &["-d", &device.loop_device])
            .await
            .context("detaching loop device");
        if let Err(e) = &detached {
            warn!(loop_device = %device.loop_device, error = %format!("{:#}", e), "failed to detach loop device");
        }

        info!(array = %array, "RAID-1 array disassembled");
        stopped.and(detached).map(|_| ())
    }
}
