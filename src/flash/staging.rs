//! Staging area shared by both flash flows.
//!
//! The orchestrator uploads a gzip-compressed image; it is written to a
//! fixed path in the working directory, inflated next to it, and the
//! compressed copy removed.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::paths::WorkdirPaths;

#[derive(Debug, Clone)]
pub struct ImageStaging {
    compressed: PathBuf,
    image: PathBuf,
}

impl ImageStaging {
    pub fn new(paths: &WorkdirPaths) -> Self {
        Self {
            compressed: paths.staged_compressed(),
            image: paths.staged_image(),
        }
    }

    pub fn compressed_path(&self) -> &Path {
        &self.compressed
    }

    pub fn image_path(&self) -> &Path {
        &self.image
    }

    /// Write an uploaded compressed image to the staging path
    pub async fn receive<R>(&self, mut body: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(parent) = self.compressed.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut file = tokio::fs::File::create(&self.compressed)
            .await
            .with_context(|| format!("creating {}", self.compressed.display()))?;
        let bytes = tokio::io::copy(&mut body, &mut file)
            .await
            .context("receiving image upload")?;
        file.sync_all().await.context("syncing staged image")?;

        info!(path = %self.compressed.display(), bytes, "image staged");
        Ok(bytes)
    }

    /// Inflate the staged image and remove the compressed copy
    pub async fn decompress(&self) -> Result<PathBuf> {
        let compressed = self.compressed.clone();
        let image = self.image.clone();

        let bytes = spawn_blocking(move || gunzip(&compressed, &image))
            .await
            .context("decompression task panicked")?
            .map_err(|e| WorkerError::Flash(format!("decompressing image: {:#}", e)))?;

        tokio::fs::remove_file(&self.compressed)
            .await
            .with_context(|| format!("removing {}", self.compressed.display()))?;

        info!(path = %self.image.display(), bytes, "image decompressed");
        Ok(self.image.clone())
    }

    /// Like `decompress`, but a missing compressed image means a previous
    /// call already inflated it.
    pub async fn decompress_if_present(&self) -> Result<PathBuf> {
        match tokio::fs::metadata(&self.compressed).await {
            Ok(_) => self.decompress().await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.compressed.display(), "no compressed image, assuming already decompressed");
                Ok(self.image.clone())
            }
            Err(e) => Err(e).with_context(|| format!("checking {}", self.compressed.display())),
        }
    }
}

fn gunzip(src: &Path, dest: &Path) -> Result<u64> {
    let input = File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let mut decoder = flate2::read::MultiGzDecoder::new(BufReader::new(input));

    // Inflate beside the target so a failure never leaves a half image in place
    let partial = dest.with_extension("partial");
    let mut output = BufWriter::new(
        File::create(&partial).with_context(|| format!("creating {}", partial.display()))?,
    );

    let copied = std::io::copy(&mut decoder, &mut output);
    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            drop(output);
            let _ = std::fs::remove_file(&partial);
            return Err(e).context("inflating gzip stream");
        }
    };

    let file = output
        .into_inner()
        .map_err(|e| e.into_error())
        .context("flushing decompressed image")?;
    file.sync_all().context("syncing decompressed image")?;
    std::fs::rename(&partial, dest)
        .with_context(|| format!("moving image into {}", dest.display()))?;

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::worker_error;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn test_receive_then_decompress() {
        let dir = tempfile::tempdir().unwrap();
        let staging = ImageStaging::new(&WorkdirPaths::new(dir.path()));
        let image = vec![7u8; 100_000];
        let compressed = gzip(&image);

        let bytes = staging.receive(&compressed[..]).await.unwrap();
        assert_eq!(bytes, compressed.len() as u64);

        let path = staging.decompress().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), image);
        assert!(!staging.compressed_path().exists());
    }

    #[tokio::test]
    async fn test_missing_compressed_means_already_done() {
        let dir = tempfile::tempdir().unwrap();
        let staging = ImageStaging::new(&WorkdirPaths::new(dir.path()));
        std::fs::write(staging.image_path(), b"ready").unwrap();

        let path = staging.decompress_if_present().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"ready");
    }

    #[tokio::test]
    async fn test_corrupt_upload_is_flash_error() {
        let dir = tempfile::tempdir().unwrap();
        let staging = ImageStaging::new(&WorkdirPaths::new(dir.path()));
        staging.receive(&b"definitely not gzip"[..]).await.unwrap();

        let err = staging.decompress().await.unwrap_err();
        assert!(matches!(worker_error(&err), Some(WorkerError::Flash(_))));
        // No half-written image left behind
        assert!(!staging.image_path().exists());
    }
}
