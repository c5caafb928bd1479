//! Both flash flows.
//!
//! Synchronous: `/dut/flash` stages the body, inflates and flashes in one
//! request, reporting on a stream. Asynchronous: `/dut/sendImage` stages,
//! `/dut/flashImage` inflates and flashes in the background while
//! `/dut/flashState` is polled. Both hold the same gate for the staging
//! paths.

use anyhow::Result;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{error, info};

use super::error::AppResult;
use super::stream::{line_response, with_pending, LineSender};
use super::SharedState;
use crate::flash::FlashProgress;
use crate::types::FlashState;

fn body_reader(body: Body) -> impl tokio::io::AsyncRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

pub async fn flash(State(state): State<SharedState>, body: Body) -> Response {
    let (lines, response) = line_response(StatusCode::ACCEPTED, "text/event-stream");

    tokio::spawn(async move {
        let result = with_pending(&lines, flash_streamed(&state, body, &lines)).await;
        if let Err(e) = result {
            error!(error = %format!("{:#}", e), "flash failed");
            lines.send(format!("error: {:#}", e)).await;
        }
        lines.send("status: done").await;
    });

    response
}

async fn flash_streamed(state: &SharedState, body: Body, lines: &LineSender) -> Result<()> {
    let _gate = state.flash.acquire().await;

    info!("streaming image to staging area");
    state.staging.receive(body_reader(body)).await?;
    let image = state.staging.decompress().await?;

    let (progress_tx, mut progress_rx) = mpsc::channel::<FlashProgress>(32);
    let relay_lines = lines.clone();
    let relay = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&progress) {
                relay_lines.send(format!("progress: {}", json)).await;
            }
        }
    });

    info!(image = %image.display(), "flashing");
    let result = state
        .worker
        .lock()
        .await
        .flash(&image, Some(progress_tx))
        .await;
    let _ = relay.await;
    result
}

pub async fn send_image(State(state): State<SharedState>, body: Body) -> AppResult<&'static str> {
    let _gate = state.flash.acquire().await;
    state.staging.receive(body_reader(body)).await?;
    Ok("OK")
}

pub async fn flash_image(State(state): State<SharedState>) -> impl IntoResponse {
    state.flash.set(FlashState::Pending).await;

    let background = state.clone();
    tokio::spawn(async move {
        let outcome = flash_staged(&background).await;
        match outcome {
            Ok(()) => background.flash.set(FlashState::Done).await,
            Err(e) => {
                error!(error = %format!("{:#}", e), "background flash failed");
                background.flash.set(FlashState::Error).await;
            }
        }
    });

    Json(json!({ "timeoutTries": state.flash_timeout_tries }))
}

async fn flash_staged(state: &SharedState) -> Result<()> {
    let _gate = state.flash.acquire().await;

    // A retry after a successful inflate finds only the image
    let image = state.staging.decompress_if_present().await?;

    info!(image = %image.display(), "flashing DUT");
    state.worker.lock().await.flash(&image, None).await
}

pub async fn flash_state(State(state): State<SharedState>) -> String {
    state.flash.state().await.to_string()
}
