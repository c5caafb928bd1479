//! Ownership of long-running child processes (VM, DHCP server, grabbers).
//!
//! The `Child` lives inside a watcher task so an unexpected exit is noticed
//! as soon as it happens; `stop()` asks the watcher to kill and confirms the
//! exit before returning.

use anyhow::{Context, Result};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// How a managed process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own
    Exited(ExitStatus),
    /// Killed through `stop()` or because its owner was dropped
    Killed,
    /// Waiting on the child failed
    WaitFailed(String),
}

impl ProcessExit {
    pub fn was_killed(&self) -> bool {
        matches!(self, ProcessExit::Killed)
    }
}

/// Where a child's stdout/stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Streamed line by line into tracing
    Log,
    /// Passed through to the daemon's own stdio
    Inherit,
    Discard,
    /// Left as configured on the `Command` by the caller
    Configured,
}

type KillRequest = oneshot::Sender<()>;

pub struct ManagedProcess {
    name: &'static str,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<KillRequest>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ManagedProcess {
    /// Spawn `cmd` and hand the child to a watcher task.
    pub fn spawn(name: &'static str, mut cmd: Command, output: OutputMode) -> Result<Self> {
        match output {
            OutputMode::Log => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Discard => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            OutputMode::Configured => {}
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| format!("spawning {}", name))?;
        let pid = child.id();
        info!(process = name, pid = ?pid, "process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "child", process = name, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "child", process = name, "{}", line);
                }
            });
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<KillRequest>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        warn!(process = name, %status, "process exited");
                        ProcessExit::Exited(status)
                    }
                    Err(e) => ProcessExit::WaitFailed(e.to_string()),
                },
                request = &mut kill_rx => {
                    // A dropped sender means the owner is gone; kill either way
                    if let Err(e) = child.kill().await {
                        warn!(process = name, error = %e, "failed to kill process");
                    }
                    if let Ok(ack) = request {
                        let _ = ack.send(());
                    }
                    ProcessExit::Killed
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            name,
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit, if the process has already ended
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    /// Resolves once the process has ended, however that happened.
    pub async fn exited(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Watcher gone without reporting; treat as killed
                return ProcessExit::Killed;
            }
        }
    }

    /// Kill the process and wait for its exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(ack_tx).is_ok() {
            info!(process = self.name, pid = ?self.pid, "stopping process");
            let _ = ack_rx.await;
        }
        // Send failing means the watcher already saw the exit
        let _ = self.exited().await;
    }
}
