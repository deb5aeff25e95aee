use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

/// One-shot timer backing a delivery's visibility window.
///
/// The expiry task and an explicit Ack/Nack can race; the `fired` flag makes
/// sure exactly one side wins. Whichever swaps it first proceeds, the other
/// observes the loss: a stopped timer never nacks, and a fired timer makes
/// `stop` report failure so the caller surfaces `NackTimeoutReached`.
#[derive(Debug)]
pub(crate) struct VisibilityTimer {
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl VisibilityTimer {
    pub(crate) fn new(fired: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self { fired, task }
    }

    /// Attempts to stop the timer before it fires. Returns false if the
    /// expiry already claimed the delivery.
    pub(crate) fn stop(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.task.abort();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_wins_before_expiry() {
        let fired = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(std::future::pending::<()>());
        let timer = VisibilityTimer::new(Arc::clone(&fired), task);

        assert!(timer.stop());
        assert!(fired.load(Ordering::Acquire));
        // A second stop reports the loss, like any late caller.
        assert!(!timer.stop());
    }

    #[tokio::test]
    async fn stop_reports_loss_after_expiry() {
        let fired = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(async {});
        let timer = VisibilityTimer::new(Arc::clone(&fired), task);

        // The expiry path claims the delivery first.
        assert!(!fired.swap(true, Ordering::AcqRel));
        assert!(!timer.stop());
    }
}
