//! Utility functions for external commands and retried operations.

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Run a command to completion, failing with its stderr on non-zero exit.
pub async fn run_checked(program: &str, args: &[&str]) -> Result<Output> {
    debug!(program, args = ?args, "running command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("executing {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }

    Ok(output)
}

/// Run a command feeding `input` on stdin.
pub async fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {}", program))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .with_context(|| format!("writing stdin of {}", program))?;
        // stdin is closed on drop so the child sees EOF
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("waiting for {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} failed: {}", program, stderr.trim());
    }

    Ok(output)
}

/// Bounded retry settings: fixed interval, fixed attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for RetryPolicy {
    /// Device networking usually needs a while after power-on.
    fn default() -> Self {
        Self::new(30, Duration::from_secs(10))
    }
}

/// Retry `op` until it succeeds or the policy is exhausted.
///
/// The error of the final attempt is returned as-is so callers see the
/// original failure rather than a generic "retries exhausted".
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %format!("{:#}", e),
                    "{} failed, retrying",
                    what
                );
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
