use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::error::{worker_error, WorkerError};

/// Any handler failure; rendered as a 500 with the error chain as text
pub struct AppError(anyhow::Error);

pub type AppResult<T> = Result<T, AppError>;

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = format!("{:#}", self.0);
        match worker_error(&self.0) {
            Some(WorkerError::Capability { .. }) => {
                tracing::warn!(error = %message, "request not supported by this worker")
            }
            _ => error!(error = %message, "request failed"),
        }
        (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
    }
}
