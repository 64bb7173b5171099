//! Cancellation signal for the daemon loops.
use std::time::Duration;

use tokio::sync::watch;

/// Fires the shutdown signal. Held by the termination handler.
#[derive(Debug)]
pub struct ShutdownTrigger
{
    tx: watch::Sender<bool>,
}

/// Observes the shutdown signal. Cheap to clone, one per loop.
#[derive(Debug, Clone)]
pub struct Shutdown
{
    rx: watch::Receiver<bool>,
}

/// Creates a connected trigger / observer pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keeping the sender alive is not needed, a closed channel is treated as "never".
        drop(tx);
        Shutdown { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fired. Pends forever if the trigger was dropped unfired.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `duration` unless the signal fires first.
    ///
    /// # Returns
    ///
    /// * `true` - The full duration elapsed.
    ///
    /// * `false` - Shutdown was requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_without_signal() {
        let (_trigger, shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_trigger() {
        let (trigger, shutdown) = channel();
        let sleeper = shutdown.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });

        tokio::task::yield_now().await;
        trigger.trigger();

        assert!(!handle.await.unwrap());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_fire() {
        let shutdown = Shutdown::never();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.sleep(Duration::from_secs(1)).await);
    }
}
