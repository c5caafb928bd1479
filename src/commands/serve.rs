//! `rigd serve`: own the device and expose it over HTTP.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::cli::ServeArgs;
use crate::config::DaemonConfig;
use crate::flash::{FlashTracker, ImageStaging};
use crate::network::LocalTargetResolver;
use crate::serial::SerialConsole;
use crate::server::{self, AppState};
use crate::session::{LeaseLock, SessionController};
use crate::utils::RetryPolicy;
use crate::worker::signals::{self, SignalScope};
use crate::worker::{self, DeviceContract};

/// How long a termination signal waits for the worker to become free
const RECLAIM_WAIT: Duration = Duration::from_secs(30);

pub async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let config = DaemonConfig::try_from(args).context("invalid configuration")?;
    info!(
        device_type = %config.device_type,
        port = config.port,
        workdir = %config.paths.root().display(),
        "Starting rigd"
    );

    tokio::fs::create_dir_all(config.paths.root())
        .await
        .with_context(|| format!("creating workdir {}", config.paths.root().display()))?;

    let mut dut = worker::build_worker(&config);
    dut.setup()
        .await
        .with_context(|| format!("setting up {} worker", config.device_type))?;
    let dut = worker::shared(dut);

    let lock = config.lock_path.clone().map(LeaseLock::new);
    if let Some(lock) = &lock {
        // A lock left by a previous run would block the first session
        lock.clear_stale()?;
    }

    let session = SessionController::new(dut.clone(), lock, config.heartbeat_timeout);
    let state = Arc::new(AppState {
        worker: dut.clone(),
        session: session.clone(),
        flash: FlashTracker::new(),
        staging: ImageStaging::new(&config.paths),
        contract: DeviceContract::new(
            config.device_id.clone(),
            config.device_type,
            &config.device_tags,
        ),
        resolver: LocalTargetResolver::new(),
        serial: SerialConsole::new(config.serial.path.clone(), config.serial.baud_rate),
        serial_log: config.serial_log.clone(),
        capture_dir: config.paths.capture_dir(),
        flash_timeout_tries: config.flash_timeout_tries,
        exec_retry: RetryPolicy::default(),
    });

    // Reclaim happens inside the shutdown future so open connections
    // cannot hold it up; the drain afterwards is bounded by the server.
    let mut scope = SignalScope::install()?;
    let (sig_tx, sig_rx) = oneshot::channel();
    let reclaim_session = session.clone();
    let reclaim_worker = dut.clone();
    let shutdown = async move {
        let sig = scope.recv().await;
        info!(signal = %sig, "Received termination signal, reclaiming the device");
        // A second signal terminates at once instead of being swallowed
        drop(scope);

        reclaim_session.release().await;
        // An in-flight flash holds the worker and cannot be interrupted
        match tokio::time::timeout(RECLAIM_WAIT, reclaim_worker.lock()).await {
            Ok(mut worker) => {
                // Re-raises the signal once everything is reclaimed
                if let Err(e) = worker.teardown(Some(sig)).await {
                    warn!(error = %format!("{:#}", e), "worker teardown failed");
                }
            }
            Err(_) => warn!(
                wait_secs = RECLAIM_WAIT.as_secs(),
                "worker still busy, exiting without teardown"
            ),
        }
        let _ = sig_tx.send(sig);
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let served = server::serve(listener, state, shutdown).await;

    // Only reached when teardown could not re-raise itself
    signals::reraise(sig_rx.await.ok());
    served
}
