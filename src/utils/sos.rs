//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! One `SignalOfStop` is created per peer connection. The session driver and
//! any running `send_file` hold clones; `disconnect()` cancels it and both
//! unwind at their next suspend point.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters. Calling it again is a no-op.
    pub fn cancel(&self) {
        if !self.internal.closing.swap(true, Ordering::AcqRel) {
            self.internal.notify.notify_waiters();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation. Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel() is not missed.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation wins (or had already happened).
    pub async fn race<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            res = fut => Some(res),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { sos.wait().await })
        };
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn race_prefers_cancellation() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.race(async { 7 }).await, Some(7));

        sos.cancel();
        sos.cancel();
        assert_eq!(sos.race(async { 7 }).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn race_aborts_long_sleep() {
        let sos = SignalOfStop::new();
        let canceller = sos.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let out = sos
            .race(tokio::time::sleep(Duration::from_secs(3600)))
            .await;
        assert!(out.is_none());
    }
}
