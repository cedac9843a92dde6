//! Cooperative cancellation
//!
//! A [`Shutdown`] handle flips a `watch` flag that every [`ShutdownSignal`]
//! observes. Workers check it at each dequeue and wrap every sleep in
//! [`ShutdownSignal::sleep`], so a requested stop takes effect at the next
//! suspension point rather than mid-query.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Trigger side of the cancellation flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: std::sync::Arc<watch::Sender<bool>>,
}

/// Observing side of the cancellation flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: std::sync::Arc::new(sender),
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Shutdown::new().signal()
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&mut self) {
        // An error means every trigger handle is gone, so it can never fire.
        if self.receiver.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `duration`. Returns `false` when woken early by cancellation.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleeps until `deadline`. Returns `false` when woken early by cancellation.
    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_sleep_completes_without_trigger() {
        let mut signal = ShutdownSignal::never();
        assert!(signal.sleep(Duration::from_millis(5)).await);
        assert!(!signal.is_triggered());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_interrupts_sleep() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let finished = timeout(Duration::from_secs(2), sleeper).await.unwrap().unwrap();
        assert!(!finished);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_created_after_trigger_sees_it() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();

        let mut signal = shutdown.signal();
        assert!(signal.is_triggered());
        assert!(!signal.sleep(Duration::from_secs(60)).await);
    }
}
