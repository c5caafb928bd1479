use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use tracing::warn;

use super::error::AppResult;
use super::SharedState;
use crate::capture::{archive_frames, mjpeg_part, FrameStream, MJPEG_BOUNDARY};
use crate::worker::{CaptureAction, SharedWorker};

pub async fn start(State(state): State<SharedState>) -> AppResult<&'static str> {
    // Frames are collected from the folder later; nobody follows them live
    let _frames = state
        .worker
        .lock()
        .await
        .capture_screen(CaptureAction::Start)
        .await?;
    Ok("OK")
}

pub async fn stop_and_archive(State(state): State<SharedState>) -> AppResult<Response> {
    state
        .worker
        .lock()
        .await
        .capture_screen(CaptureAction::Stop)
        .await?;
    let archive = archive_frames(&state.capture_dir).await?;
    Ok(([(header::CONTENT_TYPE, "application/gzip")], archive).into_response())
}

/// Stops the capture once the live viewer goes away
struct StopOnDrop(SharedWorker);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let worker = self.0.clone();
        tokio::spawn(async move {
            if let Err(e) = worker
                .lock()
                .await
                .capture_screen(CaptureAction::Stop)
                .await
            {
                warn!(error = %format!("{:#}", e), "failed to stop capture after live stream");
            }
        });
    }
}

pub async fn live_stream(State(state): State<SharedState>) -> AppResult<Response> {
    let frames = state
        .worker
        .lock()
        .await
        .capture_screen(CaptureAction::Start)
        .await?;
    let Some(frames) = frames else {
        return Err(anyhow::anyhow!("capture produced no frame stream").into());
    };

    let guard = StopOnDrop(state.worker.clone());
    let stream = futures::stream::unfold(
        (frames, guard),
        |(mut frames, guard): (FrameStream, StopOnDrop)| async move {
            let frame = frames.recv().await?;
            Some((Ok::<_, Infallible>(mjpeg_part(&frame)), (frames, guard)))
        },
    );

    let content_type = format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY);
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, max-age=0".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
