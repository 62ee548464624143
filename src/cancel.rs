//! Session-scoped cancellation.
//!
//! Every suspension point (navigator waits, LLM calls, probe requests,
//! store writes) checks this signal; cancellation is honored within two
//! seconds at each of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Cooperative cancellation signal shared by everything a session runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<CancellationInner>,
}

#[derive(Debug, Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested. Re-checks the flag
    /// periodically so a request racing the registration is still seen
    /// well inside the two-second bound.
    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// Sleep that wakes early when cancellation is requested.
    /// Returns true if the sleep was interrupted by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
            _ = self.cancelled() => true,
        }
    }

    /// Run a future, abandoning it when cancellation is requested or the
    /// timeout elapses. `None` means interrupted.
    pub async fn bounded<F, T>(&self, timeout: Duration, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            result = tokio::time::timeout(timeout, future) => result.ok(),
            _ = self.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_sticky() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let signal = CancellationSignal::new();
        let interrupted = signal.sleep(Duration::from_secs(1)).await;
        assert!(!interrupted);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let signal = CancellationSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });

        tokio::task::yield_now().await;
        signal.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let signal = CancellationSignal::new();
        let result = signal
            .bounded(Duration::from_millis(10), std::future::pending::<()>())
            .await;
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_returns_value() {
        let signal = CancellationSignal::new();
        let result = signal
            .bounded(Duration::from_secs(1), async { 42 })
            .await;
        assert_eq!(result, Some(42));
    }
}
