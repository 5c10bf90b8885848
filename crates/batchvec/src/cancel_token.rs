use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cooperative cancellation flag shared across batch tasks.
///
/// Cloning is cheap; all clones observe the same flag. `cancelled()` is
/// level-triggered: it resolves immediately if `cancel()` was already
/// called, no matter how late the waiter subscribes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait asynchronously until `cancel()` is called.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Register interest before the final flag check: a cancel
            // landing between check and await is still observed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn cancel_is_observed_by_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(!token.is_cancelled());
        assert!(!clone.is_cancelled());

        token.cancel();

        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_cancel() {
        let token = CancelToken::new();
        token.cancel();

        let result = timeout(Duration::from_millis(100), token.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelled_wakes_a_pending_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = timeout(Duration::from_secs(1), waiter.cancelled()).await;
        assert!(result.is_ok());
        assert!(waiter.is_cancelled());
    }
}
