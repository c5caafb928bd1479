//! Advisory update lock shared with the host OS.
//!
//! The host's updater refuses to restart us while the lock file exists, so
//! holding a session means the file exists (and we hold an flock on it).
//! Releasing removes it, unless the file was there before we took the lock.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LeaseLock {
    path: PathBuf,
}

/// A held lease; dropping it without `release` leaves the file behind
#[derive(Debug)]
pub struct HeldLease {
    file: File,
    path: PathBuf,
    /// Whether this lease created the file and so owns its removal
    created: bool,
}

impl LeaseLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Remove a lock left by a previous run of the daemon
    pub fn clear_stale(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "removed stale update lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("removing stale lock {}", self.path.display()))
            }
        }
    }

    pub fn acquire(&self) -> Result<HeldLease> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }
        let (file, created) = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)
                    .with_context(|| format!("opening lock file {}", self.path.display()))?;
                (file, false)
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("creating lock file {}", self.path.display()))
            }
        };
        if let Err(e) = file.try_lock_exclusive() {
            if created {
                let _ = std::fs::remove_file(&self.path);
            }
            return Err(e)
                .with_context(|| format!("update lock {} is held elsewhere", self.path.display()));
        }

        info!(path = %self.path.display(), created, "updates locked");
        Ok(HeldLease {
            file,
            path: self.path.clone(),
            created,
        })
    }
}

impl HeldLease {
    pub fn release(self) -> Result<()> {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to unlock update lock");
        }
        if !self.created {
            info!(path = %self.path.display(), "updates unlocked, lock file left to its owner");
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("removing lock file {}", self.path.display()))
            }
        }
        info!(path = %self.path.display(), "updates unlocked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LeaseLock::new(dir.path().join("locks/updates.lock"));

        let held = lock.acquire().unwrap();
        assert!(lock.is_locked());

        // A second holder in the same process sees the flock
        assert!(lock.acquire().is_err());

        held.release().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_release_keeps_file_it_did_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LeaseLock::new(dir.path().join("updates.lock"));
        std::fs::write(lock.path(), b"host updater").unwrap();

        let held = lock.acquire().unwrap();
        held.release().unwrap();

        assert!(lock.is_locked());
        assert_eq!(std::fs::read(lock.path()).unwrap(), b"host updater");
    }

    #[test]
    fn test_clear_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LeaseLock::new(dir.path().join("updates.lock"));
        lock.clear_stale().unwrap();

        std::fs::write(lock.path(), b"").unwrap();
        lock.clear_stale().unwrap();
        assert!(!lock.is_locked());
    }
}
