//! Shared shutdown signal
//!
//! A broadcast flag observed by every poller it is handed to. Triggering it
//! stops all of them; resetting it lets newly created pollers run again.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Broadcast shutdown flag shared between pollers
///
/// # Example
///
/// ```
/// use everruns_poller::ShutdownSignal;
///
/// let signal = ShutdownSignal::new();
/// let for_poller = signal.clone();
///
/// signal.trigger();
/// assert!(for_poller.is_triggered());
///
/// signal.reset();
/// assert!(!for_poller.is_triggered());
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Create a new, untriggered signal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger shutdown for every observer
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown signal triggered");
        }
    }

    /// Clear the signal
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Check whether the signal is currently triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Trigger the signal when the process receives Ctrl-C
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger_on_ctrl_c(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C");
                    signal.trigger();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        })
    }

    pub(crate) fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Receiving side of a [`ShutdownSignal`], held by a running poll loop
pub(crate) struct ShutdownListener {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownListener {
    /// A listener that never fires
    pub(crate) fn detached() -> Self {
        Self { rx: None }
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the signal is triggered
    ///
    /// Never resolves for a detached listener or once every sender is gone.
    pub(crate) async fn triggered(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|triggered| *triggered).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_and_reset() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());

        signal.reset();
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_clones_share_state() {
        let signal = ShutdownSignal::default();
        let other = signal.clone();

        other.trigger();
        assert!(signal.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.listener();
        assert!(!listener.is_triggered());

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        tokio::time::timeout(Duration::from_secs(1), listener.triggered())
            .await
            .expect("listener should observe the trigger");
        assert!(listener.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_sees_earlier_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let mut listener = signal.listener();
        tokio::time::timeout(Duration::from_millis(1), listener.triggered())
            .await
            .expect("already-triggered signal should resolve immediately");
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_listener_never_fires() {
        let mut listener = ShutdownListener::detached();
        assert!(!listener.is_triggered());

        let result = tokio::time::timeout(Duration::from_secs(60), listener.triggered()).await;
        assert!(result.is_err());
    }
}
