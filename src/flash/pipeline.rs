//! Verified, progress-reporting image writer.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::storage::{disk, BlockAssembler};

const CHUNK_SIZE: usize = 1 << 20;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashPhase {
    Flashing,
    Verifying,
}

/// One progress event. Serialized as the body of a `progress:` line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlashProgress {
    #[serde(rename = "type")]
    pub phase: FlashPhase,
    /// Bytes handled so far in this phase
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    /// Bytes per second since the phase started
    pub speed: f64,
    /// Seconds remaining, when the total is known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
}

pub type ProgressSender = mpsc::Sender<FlashProgress>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub bytes: u64,
    pub sha256: String,
}

/// Tracks rate and throttles events for one phase
struct ProgressMeter<'a> {
    sender: Option<&'a ProgressSender>,
    phase: FlashPhase,
    total: Option<u64>,
    started: Instant,
    last_sent: Option<Instant>,
}

impl<'a> ProgressMeter<'a> {
    fn new(sender: Option<&'a ProgressSender>, phase: FlashPhase, total: Option<u64>) -> Self {
        Self {
            sender,
            phase,
            total,
            started: Instant::now(),
            last_sent: None,
        }
    }

    fn update(&mut self, bytes: u64, force: bool) {
        let Some(sender) = self.sender else {
            return;
        };
        let now = Instant::now();
        if !force && self.last_sent.is_some_and(|t| now - t < PROGRESS_INTERVAL) {
            return;
        }
        self.last_sent = Some(now);

        let elapsed = (now - self.started).as_secs_f64();
        let speed = if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
        let percentage = self
            .total
            .filter(|&t| t > 0)
            .map(|t| (bytes as f64 / t as f64 * 100.0).min(100.0));
        let eta = self
            .total
            .filter(|_| speed > 0.0)
            .map(|t| t.saturating_sub(bytes) as f64 / speed);

        // Progress is advisory; a slow consumer just misses updates
        let _ = sender.try_send(FlashProgress {
            phase: self.phase,
            bytes,
            total: self.total,
            percentage,
            speed,
            eta,
        });
    }
}

/// Streams a source into one or more destinations, then reads every
/// destination back and compares checksums.
///
/// A failed write to any destination aborts the whole operation with that
/// first error.
#[derive(Debug, Clone)]
pub struct FlashPipeline {
    chunk_size: usize,
}

impl Default for FlashPipeline {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl FlashPipeline {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn write<R>(
        &self,
        mut source: R,
        total: Option<u64>,
        destinations: &[PathBuf],
        progress: Option<&ProgressSender>,
    ) -> Result<FlashReport>
    where
        R: AsyncRead + Unpin,
    {
        if destinations.is_empty() {
            return Err(WorkerError::Flash("no destination to write to".into()).into());
        }

        let mut outputs = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(dest)
                .await
                .map_err(|e| flash_error(format!("opening {}: {}", dest.display(), e)))?;
            outputs.push(file);
        }

        info!(destinations = ?destinations, total = ?total, "writing image");

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;
        let mut meter = ProgressMeter::new(progress, FlashPhase::Flashing, total);

        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| flash_error(format!("reading image: {}", e)))?;
            if n == 0 {
                break;
            }

            hasher.update(&buf[..n]);
            for (file, dest) in outputs.iter_mut().zip(destinations) {
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| flash_error(format!("writing {}: {}", dest.display(), e)))?;
            }
            written += n as u64;
            meter.update(written, false);
        }

        for (file, dest) in outputs.iter_mut().zip(destinations) {
            file.flush()
                .await
                .and(file.sync_all().await)
                .map_err(|e| flash_error(format!("syncing {}: {}", dest.display(), e)))?;
        }
        meter.update(written, true);

        let expected = hex::encode(hasher.finalize());
        debug!(bytes = written, sha256 = %expected, "image written, verifying");

        for dest in destinations {
            let actual = self.checksum_prefix(dest, written, progress).await?;
            if actual != expected {
                return Err(flash_error(format!(
                    "verification of {} failed: expected {}, read back {}",
                    dest.display(),
                    expected,
                    actual
                )));
            }
        }

        info!(bytes = written, "image written and verified");
        Ok(FlashReport {
            bytes: written,
            sha256: expected,
        })
    }

    /// SHA-256 of the first `len` bytes of `path`
    async fn checksum_prefix(
        &self,
        path: &Path,
        len: u64,
        progress: Option<&ProgressSender>,
    ) -> Result<String> {
        let file = File::open(path)
            .await
            .map_err(|e| flash_error(format!("reopening {}: {}", path.display(), e)))?;
        let mut reader = file.take(len);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut read: u64 = 0;
        let mut meter = ProgressMeter::new(progress, FlashPhase::Verifying, Some(len));

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| flash_error(format!("verifying {}: {}", path.display(), e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            read += n as u64;
            meter.update(read, false);
        }
        meter.update(read, true);

        if read < len {
            return Err(flash_error(format!(
                "{} is shorter than the image ({} < {} bytes)",
                path.display(),
                read,
                len
            )));
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

fn flash_error(message: String) -> anyhow::Error {
    WorkerError::Flash(message).into()
}

/// Flash `image` onto a disk file, optionally through a RAID-1 stack.
///
/// The disk is grown (sparse) to `disk_size` first. When an assembler is
/// given, its devices are torn down after the write whatever the outcome,
/// before the write's result is returned.
pub async fn flash_disk(
    pipeline: &FlashPipeline,
    image: &Path,
    disk_path: &Path,
    disk_size: u64,
    assembler: Option<&dyn BlockAssembler>,
    progress: Option<&ProgressSender>,
) -> Result<FlashReport> {
    let source = File::open(image)
        .await
        .with_context(|| format!("opening image {}", image.display()))?;
    let total = source.metadata().await.ok().map(|m| m.len());

    disk::preallocate(disk_path, disk_size).await?;

    let assembled = match assembler {
        Some(assembler) => Some(assembler.assemble(disk_path).await?),
        None => None,
    };
    let destination = assembled
        .as_ref()
        .map(|a| a.device.clone())
        .unwrap_or_else(|| disk_path.to_path_buf());

    let result = pipeline
        .write(source, total, &[destination], progress)
        .await;

    if let (Some(assembler), Some(device)) = (assembler, assembled) {
        if let Err(e) = assembler.disassemble(device).await {
            warn!(error = %format!("{:#}", e), "RAID teardown after flash failed");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::worker_error;

    #[tokio::test]
    async fn test_write_two_destinations_verified() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let dests = vec![dir.path().join("a.img"), dir.path().join("b.img")];

        let (tx, mut rx) = mpsc::channel(64);
        let report = FlashPipeline::with_chunk_size(4096)
            .write(&data[..], Some(data.len() as u64), &dests, Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(report.bytes, data.len() as u64);
        for dest in &dests {
            assert_eq!(std::fs::read(dest).unwrap(), data);
        }

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        let last_flash = events
            .iter()
            .filter(|e| e.phase == FlashPhase::Flashing)
            .last()
            .unwrap();
        assert_eq!(last_flash.bytes, data.len() as u64);
        assert_eq!(last_flash.percentage, Some(100.0));
        assert!(events.iter().any(|e| e.phase == FlashPhase::Verifying));
    }

    #[tokio::test]
    async fn test_existing_tail_is_preserved() {
        // Block-device semantics: writing a short image must not truncate
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        std::fs::write(&dest, vec![0xAAu8; 8192]).unwrap();

        FlashPipeline::default()
            .write(&[1u8; 100][..], None, &[dest.clone()], None)
            .await
            .unwrap();

        let content = std::fs::read(&dest).unwrap();
        assert_eq!(content.len(), 8192);
        assert_eq!(&content[..100], &[1u8; 100]);
        assert_eq!(content[100], 0xAA);
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_flash_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/disk.img");

        let err = FlashPipeline::default()
            .write(&b"image"[..], None, &[missing], None)
            .await
            .unwrap_err();
        assert!(matches!(worker_error(&err), Some(WorkerError::Flash(_))));
    }

    #[test]
    fn test_progress_json_shape() {
        let ev = FlashProgress {
            phase: FlashPhase::Flashing,
            bytes: 10,
            total: Some(20),
            percentage: Some(50.0),
            speed: 5.0,
            eta: Some(2.0),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "flashing");
        assert_eq!(json["percentage"], 50.0);
    }
}
