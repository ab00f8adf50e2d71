//! Shutdown signalling for the dispatcher worker.

use tokio::sync::watch;

/// Clonable handle used to stop a running worker.
///
/// Pumps observe the signal at their loop checkpoints (cycle start and
/// during the interval sleep); partition work already in flight is allowed
/// to finish.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Signal every pump to stop at its next checkpoint.
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is signalled.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}
