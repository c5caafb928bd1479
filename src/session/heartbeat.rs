use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// A refreshable one-shot timer.
///
/// `on_expire` runs once if the deadline passes without a refresh.
pub struct Heartbeat {
    window: Duration,
    deadline_tx: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn arm<F, Fut>(window: Duration, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (deadline_tx, mut deadline_rx) = watch::channel(Instant::now() + window);

        let task = tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            debug!("heartbeat window elapsed");
            on_expire().await;
        });

        Self {
            window,
            deadline_tx,
            task,
        }
    }

    /// Push the deadline a full window past now
    pub fn refresh(&self) {
        let _ = self.deadline_tx.send(Instant::now() + self.window);
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline_tx.borrow()
    }

    /// Disarm. Not used from inside `on_expire`, which would abort itself.
    pub fn cancel(self) {
        self.task.abort();
    }
}
