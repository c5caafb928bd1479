use std::path::{Path, PathBuf};

/// Fixed location of the captured DUT serial log
pub const DEFAULT_SERIAL_LOG: &str = "/reports/dut-serial.txt";

/// Layout of the daemon's working directory
#[derive(Debug, Clone)]
pub struct WorkdirPaths {
    root: PathBuf,
}

impl WorkdirPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Expand `~` in an operator-supplied working directory
    pub fn from_config(workdir: &str) -> Self {
        Self::new(shellexpand::tilde(workdir).as_ref())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compressed image as received from the orchestrator
    pub fn staged_compressed(&self) -> PathBuf {
        self.root.join("os.img.gz")
    }

    /// Decompressed image ready for flashing
    pub fn staged_image(&self) -> PathBuf {
        self.root.join("os.img")
    }

    /// Frames written by the screen grabber
    pub fn capture_dir(&self) -> PathBuf {
        self.root.join("capture")
    }

    /// Default disk backing the virtual device
    pub fn vm_disk(&self) -> PathBuf {
        self.root.join("dut-disk.img")
    }
}

/// Normalise the update-lock path.
///
/// Deployments hand us either `/tmp/x/updates` or `/tmp/x/updates.lock`; both
/// mean the lock file `/tmp/x/updates.lock`.
pub fn lease_lock_path(configured: &str) -> PathBuf {
    let base = configured.strip_suffix(".lock").unwrap_or(configured);
    PathBuf::from(format!("{}.lock", base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_paths_share_workdir() {
        let paths = WorkdirPaths::new("/data");
        assert_eq!(paths.staged_compressed(), PathBuf::from("/data/os.img.gz"));
        assert_eq!(paths.staged_image(), PathBuf::from("/data/os.img"));
        assert_eq!(paths.capture_dir(), PathBuf::from("/data/capture"));
    }

    #[test]
    fn test_lease_lock_path_normalised() {
        assert_eq!(
            lease_lock_path("/tmp/balena/updates.lock"),
            PathBuf::from("/tmp/balena/updates.lock")
        );
        assert_eq!(
            lease_lock_path("/tmp/balena/updates"),
            PathBuf::from("/tmp/balena/updates.lock")
        );
    }
}
