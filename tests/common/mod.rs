// Common test utilities for rigd integration tests
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rigd::capture::FrameStream;
use rigd::flash::{FlashTracker, ImageStaging, ProgressSender};
use rigd::network::{LocalTargetResolver, NetworkRequest};
use rigd::paths::WorkdirPaths;
use rigd::serial::SerialConsole;
use rigd::server::{self, AppState, SharedState};
use rigd::session::SessionController;
use rigd::types::DeviceType;
use rigd::utils::RetryPolicy;
use rigd::worker::{self, CaptureAction, DeviceContract, Diagnostics, SharedWorker, Worker, WorkerState};

/// Images containing this marker fail to flash
pub const FAIL_MARKER: &[u8] = b"FLASH-FAIL";

/// What the fake worker has been asked to do
#[derive(Debug, Default)]
pub struct Calls {
    pub teardowns: AtomicUsize,
    pub flashed: Mutex<Vec<Vec<u8>>>,
    pub powered: Mutex<Vec<bool>>,
}

impl Calls {
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

/// In-memory worker standing in for real hardware
pub struct FakeWorker {
    calls: Arc<Calls>,
    state: WorkerState,
}

impl FakeWorker {
    pub fn new() -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (
            Self {
                calls: calls.clone(),
                state: WorkerState::default(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn device_type(&self) -> DeviceType {
        DeviceType::Manual
    }

    fn state(&self) -> &WorkerState {
        &self.state
    }

    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn power_on(&mut self) -> Result<()> {
        self.calls.powered.lock().unwrap().push(true);
        Ok(())
    }

    async fn power_off(&mut self) -> Result<()> {
        self.calls.powered.lock().unwrap().push(false);
        Ok(())
    }

    async fn flash(&mut self, image: &Path, _progress: Option<ProgressSender>) -> Result<()> {
        let data = tokio::fs::read(image).await?;
        if data.windows(FAIL_MARKER.len()).any(|w| w == FAIL_MARKER) {
            bail!("simulated write failure");
        }
        self.calls.flashed.lock().unwrap().push(data);
        Ok(())
    }

    async fn network(&mut self, _request: &NetworkRequest) -> Result<()> {
        self.state.network.wired = Some("fake0".into());
        Ok(())
    }

    async fn capture_screen(&mut self, _action: CaptureAction) -> Result<Option<FrameStream>> {
        Ok(None)
    }

    async fn diagnostics(&self) -> Result<Diagnostics> {
        let mut diag = Diagnostics::new();
        diag.insert("fake".into(), true.into());
        Ok(diag)
    }

    async fn teardown(&mut self, _signal: Option<Signal>) -> Result<()> {
        self.calls.teardowns.fetch_add(1, Ordering::SeqCst);
        self.state = WorkerState::default();
        Ok(())
    }
}

pub fn fake_worker() -> (SharedWorker, Arc<Calls>) {
    let (fake, calls) = FakeWorker::new();
    (worker::shared(Box::new(fake)), calls)
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A daemon serving a fake worker on an ephemeral port
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub state: SharedState,
    pub calls: Arc<Calls>,
    pub workdir: tempfile::TempDir,
}

/// Server state over a fake worker, rooted in `workdir`
pub fn app_state(workdir: &Path) -> (SharedState, Arc<Calls>) {
    let paths = WorkdirPaths::new(workdir);
    let (worker, calls) = fake_worker();

    let state = Arc::new(AppState {
        worker: worker.clone(),
        session: SessionController::without_tunnel_sweep(worker, None, Duration::from_secs(300)),
        flash: FlashTracker::new(),
        staging: ImageStaging::new(&paths),
        contract: DeviceContract::new(
            "0123abcd".into(),
            DeviceType::Manual,
            "dut=true,modem=false",
        ),
        resolver: LocalTargetResolver::new(),
        serial: SerialConsole::new(workdir.join("ttyFAKE"), 115200),
        serial_log: workdir.join("dut-serial.txt"),
        capture_dir: paths.capture_dir(),
        flash_timeout_tries: 60,
        exec_retry: RetryPolicy::default(),
    });
    (state, calls)
}

impl TestDaemon {
    pub async fn start() -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let (state, calls) = app_state(workdir.path());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = state.clone();
        tokio::spawn(async move {
            let _ = server::serve(listener, served, std::future::pending()).await;
        });

        Self {
            addr,
            state,
            calls,
            workdir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}
