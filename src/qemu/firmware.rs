use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::WorkerError;
use crate::types::Architecture;

/// UEFI code image plus its variable store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePair {
    pub code: PathBuf,
    pub vars: PathBuf,
}

impl FirmwarePair {
    pub fn new(code: impl Into<PathBuf>, vars: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            vars: vars.into(),
        }
    }
}

/// Locations searched in order; distributions disagree on where these live
pub fn default_candidates(arch: Architecture) -> Vec<FirmwarePair> {
    match arch {
        Architecture::X86_64 => vec![
            FirmwarePair::new("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
            FirmwarePair::new(
                "/usr/share/qemu/edk2-x86_64-code.fd",
                "/usr/share/qemu/edk2-i386-vars.fd",
            ),
            FirmwarePair::new(
                "/usr/share/ovmf/x64/OVMF_CODE.fd",
                "/usr/share/ovmf/x64/OVMF_VARS.fd",
            ),
        ],
        Architecture::Aarch64 => vec![
            FirmwarePair::new("/usr/share/OVMF/QEMU_EFI.fd", "/usr/share/OVMF/QEMU_VARS.fd"),
            FirmwarePair::new(
                "/usr/share/qemu/edk2-aarch64-code.fd",
                "/usr/share/qemu/edk2-arm-vars.fd",
            ),
            FirmwarePair::new(
                "/usr/share/AAVMF/AAVMF_CODE.fd",
                "/usr/share/AAVMF/AAVMF_VARS.fd",
            ),
        ],
    }
}

/// First candidate whose code and vars files both exist
pub async fn find_firmware(candidates: &[FirmwarePair]) -> Option<FirmwarePair> {
    for pair in candidates {
        if exists(&pair.code).await && exists(&pair.vars).await {
            return Some(pair.clone());
        }
    }
    None
}

/// Probe the default locations for `arch`, failing as a missing prerequisite
pub async fn resolve_firmware(arch: Architecture) -> Result<FirmwarePair> {
    let candidates = default_candidates(arch);
    match find_firmware(&candidates).await {
        Some(pair) => {
            info!(arch = %arch, code = %pair.code.display(), vars = %pair.vars.display(), "found UEFI firmware");
            Ok(pair)
        }
        None => Err(WorkerError::prerequisite(
            format!("unable to find UEFI firmware for {}", arch),
            "install the OVMF/AAVMF package or set QEMU_FIRMWARE_CODE and QEMU_FIRMWARE_VARS",
        )
        .into()),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
