// =============================================================================
// Run Flag — the single cancellation signal shared by every loop
// =============================================================================
//
// Loops check `is_running()` at the top of each iteration and use
// `sleep()` for every wait, which returns early (with `false`) the moment
// the flag is cleared. Once cleared, a flag never becomes true again.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct RunFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl RunFlag {
    /// A new flag in the running state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clear the flag and wake every waiter.
    pub fn stop(&self) {
        self.tx.send_replace(false);
    }

    /// Resolve once the flag is cleared.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Sleep for `duration` unless the flag is cleared first.
    ///
    /// Returns `true` if the caller should keep going.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = self.stopped() => false,
        }
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}
