//! Single-flight runner for reconciliation passes.
//!
//! Requests never run in parallel. Any number of requests arriving while a
//! pass is in flight collapse into exactly one follow-up pass.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Cloneable handle used to ask for another pass.
#[derive(Debug, Clone)]
pub struct Trigger {
    requested: Arc<Notify>,
}

impl Trigger {
    pub fn request(&self) {
        // notify_one keeps at most one stored permit, which is the coalescing.
        self.requested.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct SyncDriver {
    requested: Arc<Notify>,
}

impl SyncDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) -> Trigger {
        Trigger {
            requested: self.requested.clone(),
        }
    }

    /// Run `pass` once per (coalesced) request until `cancel` fires.
    /// A pass already in flight is allowed to finish. Returns the number of
    /// passes run.
    pub async fn run<F, Fut>(self, cancel: CancellationToken, mut pass: F) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut runs = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.requested.notified() => {}
            }
            pass().await;
            runs += 1;
        }
        tracing::debug!(runs, "sync driver stopped");
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Gate {
        started: Notify,
        release: Notify,
        runs: AtomicUsize,
    }

    fn gated_pass(gate: Arc<Gate>) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        move || {
            let gate = gate.clone();
            Box::pin(async move {
                gate.runs.fetch_add(1, Ordering::SeqCst);
                gate.started.notify_one();
                gate.release.notified().await;
            })
        }
    }

    #[tokio::test]
    async fn requests_during_a_pass_coalesce_into_one() {
        let gate = Arc::new(Gate {
            started: Notify::new(),
            release: Notify::new(),
            runs: AtomicUsize::new(0),
        });
        let driver = SyncDriver::new();
        let trigger = driver.trigger();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(driver.run(cancel.clone(), gated_pass(gate.clone())));

        trigger.request();
        gate.started.notified().await;
        for _ in 0..5 {
            trigger.request();
        }
        gate.release.notify_one();

        gate.started.notified().await;
        gate.release.notify_one();

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let runs = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runs, 2);
        assert_eq!(gate.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_driver_stops_on_cancel() {
        let driver = SyncDriver::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(cancel.clone(), || async {}));
        cancel.cancel();
        let runs = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runs, 0);
    }
}
