//! Line-oriented streamed responses.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const PENDING_INTERVAL: Duration = Duration::from_secs(5);
pub const PENDING_LINE: &str = "status: pending";

/// Sender half of a streamed response; each message is one line
#[derive(Clone)]
pub struct LineSender(mpsc::Sender<String>);

impl LineSender {
    /// A client that went away is not an error
    pub async fn send(&self, line: impl Into<String>) {
        let mut line = line.into();
        line.push('\n');
        let _ = self.0.send(line).await;
    }
}

/// A response whose body is fed line by line through the returned sender
pub fn line_response(status: StatusCode, content_type: &'static str) -> (LineSender, Response) {
    let (tx, rx) = mpsc::channel::<String>(32);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(Bytes::from(line)), rx))
    });
    let response = (
        status,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(stream),
    )
        .into_response();
    (LineSender(tx), response)
}

/// Drive `op` to completion, writing a pending line every interval meanwhile
pub async fn with_pending<F: Future>(lines: &LineSender, op: F) -> F::Output {
    tokio::pin!(op);
    let mut ticker =
        tokio::time::interval_at(Instant::now() + PENDING_INTERVAL, PENDING_INTERVAL);
    loop {
        tokio::select! {
            out = &mut op => return out,
            _ = ticker.tick() => lines.send(PENDING_LINE).await,
        }
    }
}
