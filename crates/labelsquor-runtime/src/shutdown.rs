//! Cooperative shutdown signal shared by the runtime loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Flag plus wakeup: loops check [Shutdown::is_triggered] each iteration and
/// select on [Shutdown::notified] while sleeping, so a trigger interrupts
/// idle waits immediately.
#[derive(Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Sleep for `duration` unless shutdown triggers first; returns true if
    /// the sleep was interrupted by shutdown.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = self.notified() => true,
            _ = tokio::time::sleep(duration) => self.is_triggered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_interrupts_sleep() {
        let shutdown = Shutdown::new();
        let waiter = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            waiter.sleep(std::time::Duration::from_secs(30)).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.trigger();
        assert!(handle.await.unwrap());
        assert!(shutdown.is_triggered());
    }
}
