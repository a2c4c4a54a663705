//! Supervised background loops.
//!
//! Each long-running loop moves through a small lifecycle: `Starting` until
//! its first successful cycle, `Running` while healthy, `BackingOff` while a
//! transient failure waits out its retry delay, `Stopped` after shutdown.
//! States live in a shared registry surfaced on `/health`. A loop whose
//! future escapes with an error or panic is restarted with capped backoff
//! instead of silently vanishing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error};

const RESTART_BASE: Duration = Duration::from_secs(1);
const RESTART_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    BackingOff,
    Stopped,
}

#[derive(Default)]
pub struct LoopStatusRegistry {
    inner: RwLock<HashMap<&'static str, LoopState>>,
}

impl LoopStatusRegistry {
    pub fn set(&self, name: &'static str, state: LoopState) {
        let mut inner = self.inner.write();
        let previous = inner.insert(name, state);
        if previous != Some(state) {
            debug!(loop_name = name, ?previous, ?state, "loop state transition");
        }
    }

    pub fn get(&self, name: &str) -> Option<LoopState> {
        self.inner.read().get(name).copied()
    }

    pub fn snapshot(&self) -> HashMap<&'static str, LoopState> {
        self.inner.read().clone()
    }
}

/// Handle a loop uses to report its own transitions (e.g. `Running` after the
/// first successful cycle, `BackingOff` during an internal reconnect wait).
#[derive(Clone)]
pub struct LoopStatus {
    name: &'static str,
    registry: Arc<LoopStatusRegistry>,
}

impl LoopStatus {
    pub fn new(name: &'static str, registry: Arc<LoopStatusRegistry>) -> Self {
        registry.set(name, LoopState::Starting);
        Self { name, registry }
    }

    pub fn set(&self, state: LoopState) {
        self.registry.set(self.name, state);
    }
}

/// Spawn a loop under supervision. `make` builds a fresh future per attempt;
/// a clean `Ok(())` exit (shutdown) ends supervision, an error or panic
/// restarts the loop after a capped backoff delay.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    registry: Arc<LoopStatusRegistry>,
    shutdown: watch::Receiver<bool>,
    make: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        let mut delay = RESTART_BASE;

        loop {
            registry.set(name, LoopState::Starting);
            let outcome = tokio::spawn(make()).await;

            if *shutdown.borrow() {
                break;
            }

            match outcome {
                Ok(Ok(())) => {
                    debug!(loop_name = name, "loop exited cleanly");
                    break;
                }
                Ok(Err(e)) => {
                    error!(loop_name = name, error = %e, "loop escaped with error; restarting");
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(loop_name = name, "loop panicked; restarting");
                }
                Err(_) => break, // cancelled
            }

            registry.set(name, LoopState::BackingOff);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            delay = (delay * 2).min(RESTART_CAP);
        }

        registry.set(name, LoopState::Stopped);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn restarts_until_clean_exit() {
        let registry = Arc::new(LoopStatusRegistry::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let handle = spawn_supervised("flaky", registry.clone(), shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("boom");
                }
                Ok(())
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(registry.get("flaky"), Some(LoopState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_observed_during_backoff() {
        let registry = Arc::new(LoopStatusRegistry::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_supervised("always_failing", registry.clone(), shutdown_rx, || async {
            anyhow::bail!("boom")
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(registry.get("always_failing"), Some(LoopState::Stopped));
    }

    #[tokio::test]
    async fn loop_status_reports_transitions() {
        let registry = Arc::new(LoopStatusRegistry::default());
        let status = LoopStatus::new("sampler", registry.clone());
        assert_eq!(registry.get("sampler"), Some(LoopState::Starting));

        status.set(LoopState::Running);
        assert_eq!(registry.get("sampler"), Some(LoopState::Running));
        assert_eq!(registry.snapshot().len(), 1);
    }
}
