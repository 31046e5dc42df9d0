// Cooperative cancellation. Workers check the token at every suspension
// point: between resolver calls, before each transport attempt, and around
// headless renders.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Returns the sender half (flip to true to cancel) and the token.
    pub fn new() -> (watch::Sender<bool>, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelToken { rx })
    }

    /// A token that can never be cancelled, for tests and one-shot tools.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        CancelToken { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&mut self) {
        // An error means the sender is gone; treat that as cancellation.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
