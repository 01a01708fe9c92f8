use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cooperative cancellation flag shared between an API caller or the
/// scheduler and the work running on its behalf.
///
/// Jobs poll `is_canceled` at defined checkpoints; the browser pool awaits
/// `canceled` to force-close a page as soon as the flag fires. Once set, the
/// flag never resets.
#[derive(Debug, Default)]
pub struct CancelFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set. Registers interest before checking the
    /// flag so a concurrent `cancel` cannot be missed.
    pub async fn canceled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiter() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.canceled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(flag.is_canceled());
    }

    #[tokio::test]
    async fn canceled_returns_immediately_when_already_set() {
        let flag = CancelFlag::new();
        flag.cancel();
        tokio::time::timeout(Duration::from_millis(100), flag.canceled())
            .await
            .expect("already-set flag should resolve immediately");
    }
}
