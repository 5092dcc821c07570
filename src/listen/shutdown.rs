//! Cooperative shutdown signal shared by every receive loop.

use tokio::sync::watch;

/// Create a linked trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Sending half. Dropping it counts as triggering.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Ask every holder of the linked [`Shutdown`] to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, cheap to clone into each task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown is requested. Resolves immediately if it
    /// already was.
    pub async fn triggered(&mut self) {
        // An error means the trigger is gone, which is also a stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_all_clones() {
        let (trigger, shutdown) = shutdown_channel();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let mut s = shutdown.clone();
            waiters.push(tokio::spawn(async move { s.triggered().await }));
        }

        assert!(!shutdown.is_triggered());
        trigger.trigger();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not woken")
                .unwrap();
        }
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_late_waiter_resolves_immediately() {
        let (trigger, mut shutdown) = shutdown_channel();
        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .expect("already-triggered signal should resolve");
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .expect("dropped trigger should resolve");
    }
}
