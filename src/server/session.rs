use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use super::error::AppResult;
use super::SharedState;
use crate::session::StartOutcome;
use crate::types::FlashState;

pub async fn start(State(state): State<SharedState>) -> AppResult<&'static str> {
    Ok(match state.session.start().await? {
        StartOutcome::Started => "OK",
        StartOutcome::Busy => "BUSY",
    })
}

pub async fn heartbeat(State(state): State<SharedState>) -> &'static str {
    state.session.heartbeat().await;
    "OK"
}

pub async fn state(State(state): State<SharedState>) -> String {
    state.session.state().await.to_string()
}

pub async fn teardown(State(state): State<SharedState>) -> &'static str {
    state.session.teardown().await;
    state.flash.set(FlashState::Idle).await;
    "OK"
}

pub async fn contract(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.contract.clone())
}
