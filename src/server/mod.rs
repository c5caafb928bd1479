//! HTTP control surface driven by the test-suite orchestrator.

mod capture;
mod dut;
pub mod error;
mod flash;
mod session;
pub mod stream;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::flash::{FlashTracker, ImageStaging};
use crate::network::LocalTargetResolver;
use crate::serial::SerialConsole;
use crate::session::SessionController;
use crate::utils::RetryPolicy;
use crate::worker::{DeviceContract, SharedWorker};

pub struct AppState {
    pub worker: SharedWorker,
    pub session: SessionController,
    pub flash: FlashTracker,
    pub staging: ImageStaging,
    pub contract: DeviceContract,
    pub resolver: LocalTargetResolver,
    pub serial: SerialConsole,
    pub serial_log: PathBuf,
    pub capture_dir: PathBuf,
    /// Poll count suggested to clients of the background flash
    pub flash_timeout_tries: u32,
    pub exec_retry: RetryPolicy,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/start", get(session::start))
        .route("/heartbeat", get(session::heartbeat))
        .route("/state", get(session::state))
        .route("/teardown", post(session::teardown))
        .route("/contract", get(session::contract))
        .route("/dut/on", post(dut::power_on))
        .route("/dut/off", post(dut::power_off))
        .route("/dut/network", post(dut::network))
        .route("/dut/ip", get(dut::ip))
        .route("/dut/diagnostics", get(dut::diagnostics))
        .route("/dut/serial", get(dut::serial_log))
        .route("/dut/serial/exec", post(dut::serial_exec))
        .route("/dut/keyboard", post(dut::keyboard))
        .route("/dut/exec", post(dut::exec))
        .route(
            "/dut/capture",
            post(capture::start).get(capture::stop_and_archive),
        )
        .route("/dut/liveStream", get(capture::live_stream))
        .route("/dut/flash", post(flash::flash))
        .route("/dut/sendImage", post(flash::send_image))
        .route("/dut/flashImage", post(flash::flash_image))
        .route("/dut/flashState", get(flash::flash_state))
        // Images are gigabytes
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open connections get this long to finish once shutdown begins
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Serve until `shutdown` resolves.
///
/// Live streams and uploads may never end on their own, so the drain after
/// shutdown is bounded by [`SHUTDOWN_GRACE`].
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("reading listener address")?;
    info!(addr = %addr, "Listening");

    let (fired_tx, fired_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = fired_tx.send(());
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        biased;
        result = &mut server => {
            result.context("Server error")?;
            info!("Server stopped");
            return Ok(());
        }
        _ = fired_rx => {}
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(result) => result.context("Server error")?,
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "connections still open after shutdown grace, closing"
        ),
    }

    info!("Server stopped");
    Ok(())
}
