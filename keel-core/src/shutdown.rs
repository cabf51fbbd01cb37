use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Cloneable cancellation flag shared by background loops.
///
/// Once triggered it stays triggered; every clone observes the same state.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning `false` if shutdown fired first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.triggered(),
            _ = notified => false,
        }
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_is_interrupted_by_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.trigger();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn triggered_signal_short_circuits() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        assert!(!signal.sleep(Duration::from_secs(30)).await);
        signal.wait().await;
    }

    #[tokio::test]
    async fn untriggered_sleep_completes() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }
}
