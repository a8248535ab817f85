use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

/// A cancellation token shared by every stage of a pipeline.
///
/// Cancelling is idempotent and visible to all clones.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
