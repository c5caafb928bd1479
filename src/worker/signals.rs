//! Scoped SIGINT/SIGTERM handling around a worker's lifetime.

use anyhow::{Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use tokio::signal::unix::{signal as listen, SignalKind};
use tracing::{info, warn};

/// Termination signals routed to teardown while held
pub struct SignalScope {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

impl SignalScope {
    pub fn install() -> Result<Self> {
        let sigint = listen(SignalKind::interrupt()).context("registering SIGINT handler")?;
        let sigterm = listen(SignalKind::terminate()).context("registering SIGTERM handler")?;
        info!("termination signals bound to teardown");
        Ok(Self { sigint, sigterm })
    }

    /// Wait for the next termination signal
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.sigint.recv() => Signal::SIGINT,
            _ = self.sigterm.recv() => Signal::SIGTERM,
        }
    }
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        // Later signals terminate the process instead of being swallowed
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            restore_default(sig);
        }
    }
}

fn restore_default(sig: Signal) {
    // SAFETY: installs the default disposition; no handler code runs here
    if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
        warn!(signal = %sig, error = %e, "failed to restore default signal handler");
    }
}

/// Deliver `signal` to ourselves with default handling, after a teardown
/// that was triggered by it
pub fn reraise(signal: Option<Signal>) {
    let Some(sig) = signal else {
        return;
    };
    info!(signal = %sig, "re-raising signal after teardown");
    restore_default(sig);
    if let Err(e) = signal::raise(sig) {
        warn!(signal = %sig, error = %e, "failed to re-raise signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigSet};

    #[tokio::test]
    async fn test_scope_catches_then_restores_default() {
        let mut scope = SignalScope::install().unwrap();
        signal::raise(Signal::SIGTERM).unwrap();
        assert_eq!(scope.recv().await, Signal::SIGTERM);

        drop(scope);
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: swaps default for default to read the current disposition
        let previous = unsafe { sigaction(Signal::SIGTERM, &dfl) }.unwrap();
        assert_eq!(previous.handler(), SigHandler::SigDfl);

        // Nothing to deliver without a triggering signal
        reraise(None);
    }
}
