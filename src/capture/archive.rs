use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::Path;
use tokio::task::spawn_blocking;
use tracing::debug;

const ARCHIVE_ROOT: &str = "capture";
const GZIP_LEVEL: u32 = 6;

/// tar.gz of every file in the capture folder, under `capture/`
pub async fn archive_frames(dir: &Path) -> Result<Bytes> {
    let dir = dir.to_owned();
    spawn_blocking(move || archive_frames_sync(&dir))
        .await
        .context("archive task panicked")?
}

fn archive_frames_sync(dir: &Path) -> Result<Bytes> {
    let encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    if dir.is_dir() {
        builder
            .append_dir_all(ARCHIVE_ROOT, dir)
            .with_context(|| format!("archiving {}", dir.display()))?;
    }

    let encoder = builder.into_inner().context("finishing tar archive")?;
    let compressed = encoder.finish().context("finishing gzip stream")?;
    debug!(dir = %dir.display(), bytes = compressed.len(), "capture archive built");

    Ok(Bytes::from(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[tokio::test]
    async fn test_archive_contains_frames() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("000001.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join("000002.jpg"), b"two").unwrap();

        let data = archive_frames(dir.path()).await.unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&data[..]));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".jpg"))
            .collect();
        names.sort();
        assert_eq!(names, vec!["capture/000001.jpg", "capture/000002.jpg"]);
    }

    #[tokio::test]
    async fn test_missing_folder_gives_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive_frames(&dir.path().join("absent")).await.unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&data[..]));
        assert_eq!(archive.entries().unwrap().count(), 0);
    }
}
