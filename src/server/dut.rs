use anyhow::{anyhow, Context};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::error::AppResult;
use super::stream::{line_response, with_pending};
use super::SharedState;
use crate::network::NetworkRequest;
use crate::remote::exec_on_target;
use crate::serial::read_serial_log;

#[derive(Deserialize)]
pub struct TargetQuery {
    target: Option<String>,
}

#[derive(Deserialize)]
pub struct KeyRequest {
    key: String,
}

#[derive(Deserialize)]
pub struct SerialExecRequest {
    cmd: String,
}

#[derive(Deserialize)]
pub struct ExecRequest {
    target: String,
    cmd: String,
}

#[derive(Clone, Copy)]
enum Power {
    On,
    Off,
}

/// Power operations can take a while; the body carries pending lines until
/// the final `OK` or `error:` line.
fn power(state: SharedState, power: Power) -> Response {
    let (lines, response) = line_response(StatusCode::OK, "text/plain");
    tokio::spawn(async move {
        let result = with_pending(&lines, async {
            let mut worker = state.worker.lock().await;
            match power {
                Power::On => worker.power_on().await,
                Power::Off => worker.power_off().await,
            }
        })
        .await;
        match result {
            Ok(()) => lines.send("OK").await,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "power operation failed");
                lines.send(format!("error: {:#}", e)).await
            }
        }
    });
    response
}

pub async fn power_on(State(state): State<SharedState>) -> Response {
    power(state, Power::On)
}

pub async fn power_off(State(state): State<SharedState>) -> Response {
    power(state, Power::Off)
}

pub async fn network(
    State(state): State<SharedState>,
    Json(request): Json<NetworkRequest>,
) -> AppResult<&'static str> {
    state.worker.lock().await.network(&request).await?;
    Ok("OK")
}

/// The target may come as `?target=` or in a JSON body
pub async fn ip(
    State(state): State<SharedState>,
    Query(query): Query<TargetQuery>,
    body: Bytes,
) -> AppResult<String> {
    let target = match query.target {
        Some(target) => target,
        None if !body.is_empty() => {
            let parsed: TargetQuery =
                serde_json::from_slice(&body).context("parsing request body")?;
            parsed.target.ok_or_else(|| anyhow!("Target missing"))?
        }
        None => return Err(anyhow!("Target missing").into()),
    };
    Ok(state.resolver.resolve(&target).await?)
}

pub async fn diagnostics(State(state): State<SharedState>) -> AppResult<impl IntoResponse> {
    let diag = state.worker.lock().await.diagnostics().await?;
    Ok(Json(diag))
}

pub async fn serial_log(State(state): State<SharedState>) -> AppResult<impl IntoResponse> {
    let log = read_serial_log(&state.serial_log).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], log))
}

pub async fn serial_exec(
    State(state): State<SharedState>,
    Json(request): Json<SerialExecRequest>,
) -> AppResult<String> {
    Ok(state.serial.exec(&request.cmd).await?)
}

pub async fn keyboard(
    State(state): State<SharedState>,
    Json(request): Json<KeyRequest>,
) -> AppResult<&'static str> {
    tracing::info!(key = %request.key, "pressing key");
    state
        .worker
        .lock()
        .await
        .keyboard_press(&request.key)
        .await?;
    Ok("OK")
}

pub async fn exec(
    State(state): State<SharedState>,
    Json(request): Json<ExecRequest>,
) -> AppResult<String> {
    Ok(exec_on_target(&state.resolver, &request.target, &request.cmd, state.exec_retry).await?)
}
