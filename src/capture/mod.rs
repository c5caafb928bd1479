//! Screen capture of the DUT's display.
//!
//! A GStreamer pipeline grabs one JPEG per second into the capture folder.
//! Consumers either follow new frames as they land or take a compressed
//! archive of the whole folder once capture stops.

pub mod archive;

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::mpsc;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::process::{ManagedProcess, OutputMode};

pub use archive::archive_frames;

pub const MJPEG_BOUNDARY: &str = "FRAME";

/// Frames as they are captured
pub type FrameStream = mpsc::Receiver<Bytes>;

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// The VM's VNC server on 127.0.0.1
    Vnc { port: u16 },
    /// A V4L2 capture card
    Video { device: PathBuf },
}

pub struct ScreenCapture {
    dir: PathBuf,
    source: CaptureSource,
    process: Option<ManagedProcess>,
}

impl ScreenCapture {
    pub fn new(dir: PathBuf, source: CaptureSource) -> Self {
        Self {
            dir,
            source,
            process: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Change the source; takes effect on the next `start`
    pub fn set_source(&mut self, source: CaptureSource) {
        self.source = source;
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(ManagedProcess::is_running)
    }

    /// gst-launch pipeline, one token per argument
    pub fn pipeline_args(&self) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        match &self.source {
            CaptureSource::Vnc { port } => {
                args.push("rfbsrc".into());
                args.push("host=127.0.0.1".into());
                args.push(format!("port={}", port));
                args.push("view-only=true".into());
            }
            CaptureSource::Video { device } => {
                args.push("v4l2src".into());
                args.push(format!("device={}", device.display()));
            }
        }
        for element in [
            "!",
            "videoconvert",
            "!",
            "videorate",
            "!",
            "video/x-raw,framerate=1/1",
            "!",
            "jpegenc",
            "!",
            "multifilesink",
        ] {
            args.push(element.into());
        }
        args.push(format!("location={}", self.dir.join("%06d.jpg").display()));
        args
    }

    /// Start grabbing into an emptied capture folder and follow its frames
    pub async fn start(&mut self) -> Result<FrameStream> {
        self.stop().await;

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("clearing {}", self.dir.display()))
            }
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let mut cmd = Command::new("gst-launch-1.0");
        cmd.args(self.pipeline_args());
        self.process = Some(ManagedProcess::spawn("gst-launch", cmd, OutputMode::Log)?);

        info!(dir = %self.dir.display(), source = ?self.source, "screen capture started");
        watch_frames(self.dir.clone()).await
    }

    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.stop().await;
            info!(dir = %self.dir.display(), "screen capture stopped");
        }
    }
}

/// Follow the capture folder, yielding each frame once it is complete.
///
/// The newest file may still be open in the grabber, so a frame is sent
/// only after a later one appears. Frames already in the folder are
/// picked up first.
pub async fn watch_frames(dir: PathBuf) -> Result<FrameStream> {
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let (created_tx, mut created_rx) = mpsc::unbounded_channel::<String>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if matches!(event.kind, EventKind::Create(_)) => {
            for path in &event.paths {
                if let Some(name) = frame_name(path) {
                    let _ = created_tx.send(name);
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "capture folder watch error"),
    })
    .context("creating capture folder watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", dir.display()))?;

    // Listed after the watch is armed so nothing falls in between
    let existing = list_frames(&dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        // Dropping the watcher ends the notifications
        let _watcher = watcher;
        let mut follower = FrameFollower::default();

        for name in existing {
            if let Some(done) = follower.observe(name) {
                if !send_frame(&tx, &dir, &done).await {
                    return;
                }
            }
        }

        loop {
            let name = tokio::select! {
                name = created_rx.recv() => match name {
                    Some(name) => name,
                    None => return,
                },
                _ = tx.closed() => return,
            };
            if let Some(done) = follower.observe(name) {
                if !send_frame(&tx, &dir, &done).await {
                    return;
                }
            }
        }
    });

    Ok(rx)
}

/// Tracks the frame still being written. Names are zero-padded sequence
/// numbers, so they order lexically.
#[derive(Debug, Default)]
struct FrameFollower {
    pending: Option<String>,
}

impl FrameFollower {
    /// Note a new frame; returns the one it completes, if any
    fn observe(&mut self, name: String) -> Option<String> {
        match &self.pending {
            Some(pending) if name <= *pending => None,
            _ => self.pending.replace(name),
        }
    }
}

/// False once the consumer has gone away
async fn send_frame(tx: &mpsc::Sender<Bytes>, dir: &Path, name: &str) -> bool {
    match tokio::fs::read(dir.join(name)).await {
        Ok(data) => tx.send(Bytes::from(data)).await.is_ok(),
        Err(e) => {
            debug!(frame = %name, error = %e, "failed to read frame");
            true
        }
    }
}

fn frame_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    name.ends_with(".jpg").then_some(name)
}

/// JPEG file names in the folder, oldest first
async fn list_frames(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = frame_name(&entry.path()) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// One part of a `multipart/x-mixed-replace` MJPEG stream
pub fn mjpeg_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        frame.len()
    );
    let mut part = Vec::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
