//! Level-triggered wake-up signal

use tokio::sync::watch;

/// An async manual reset event
///
/// Once set, every waiter returns immediately until the event is reset.
#[derive(Debug)]
pub struct ManualResetEvent {
    state: watch::Sender<bool>,
}

impl ManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        let (state, _) = watch::channel(initially_set);
        Self { state }
    }

    pub fn set(&self) {
        self.state.send_replace(true);
    }

    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the event is set
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}
