use tokio::sync::watch;

/// Signals an orchestration run to stop at the next safe point.
///
/// In-flight calls are never interrupted. Node sequences check the token between transitions and stop there,
/// leaving every completed step applied.
#[derive(Clone, Debug)]
pub struct Cancellation {
    sender: std::sync::Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Cancellation {
            sender: std::sync::Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once the run is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // An error means every sender is gone, so cancellation can no longer happen.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_observed_by_clones() {
        let cancellation = Cancellation::new();
        let observer = cancellation.clone();
        assert!(!observer.is_cancelled());

        let waiter = tokio::spawn(async move { observer.cancelled().await });
        cancellation.cancel();
        waiter.await.unwrap();
        assert!(cancellation.is_cancelled());
    }
}
