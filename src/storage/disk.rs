use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs::OpenOptions;
use tracing::debug;

/// Grow `path` to at least `size` bytes without writing data (sparse).
/// An existing larger file is left alone.
pub async fn preallocate(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let current = file.metadata().await?.len();
    if current < size {
        file.set_len(size)
            .await
            .with_context(|| format!("extending {} to {} bytes", path.display(), size))?;
        debug!(disk = %path.display(), from = current, to = size, "preallocated disk");
    }

    Ok(())
}
