/*
[INPUT]:  Open/clear calls from event handlers, timed waits from the controller
[OUTPUT]: Gate - a latched condition with timeout semantics
[POS]:    Concurrency layer - callback-to-controller signalling
[UPDATE]: When wait/notify semantics change
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A latched condition: event handlers `open()` it, the controller
/// `clear()`s it before issuing a request and then `wait()`s. The flag is
/// re-checked after every wakeup, so spurious notifies are harmless, and an
/// `open()` that lands before the `wait()` is never lost.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    ready: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the latch before issuing the request it guards.
    pub fn clear(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
    }

    /// Latch and wake every waiter.
    pub fn open(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Wait until the gate opens or the timeout elapses. Returns whether
    /// the gate opened; a timeout is not an error, callers downgrade to
    /// retry-next-cycle semantics.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.inner.ready.load(Ordering::SeqCst) {
                return true;
            }

            // Register interest before the final flag check so an open()
            // racing this loop still wakes us.
            let notified = self.inner.notify.notified();
            if self.inner.ready.load(Ordering::SeqCst) {
                return true;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.inner.ready.load(Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_returns_true_once_opened() {
        let gate = Gate::new();
        let waiter = gate.clone();

        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.open();

        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_never_opened() {
        let gate = Gate::new();
        assert!(!gate.wait(Duration::from_millis(200)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn open_before_wait_is_not_lost() {
        let gate = Gate::new();
        gate.open();
        assert!(gate.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_the_latch() {
        let gate = Gate::new();
        gate.open();
        gate.clear();
        assert!(!gate.wait(Duration::from_millis(10)).await);
    }
}
