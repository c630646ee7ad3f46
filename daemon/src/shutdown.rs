use strum::Display;
use tokio::sync::broadcast;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum ShutdownReason {
    #[strum(to_string = "interrupted")]
    Interrupted,
    #[strum(to_string = "capture duration reached")]
    DurationElapsed,
    #[strum(to_string = "device lost")]
    DeviceLost,
}

/// A shutdown signal that any number of tasks can trigger and wait on. The first reason given
/// is the one everyone sees.
pub struct Shutdown {
    reason: Option<ShutdownReason>,
    sender: broadcast::Sender<ShutdownReason>,
    receiver: broadcast::Receiver<ShutdownReason>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = broadcast::channel(1);
        Self {
            reason: None,
            sender,
            receiver,
        }
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        let _ = self.sender.send(reason);
    }

    pub async fn recv(&mut self) -> ShutdownReason {
        if let Some(reason) = self.reason {
            return reason;
        }

        // Lagging means a second trigger overwrote the first, any reason will do at that point.
        let reason = match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Interrupted,
        };
        self.reason = Some(reason);
        reason
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        let sender = self.sender.clone();
        let receiver = self.sender.subscribe();
        Self {
            reason: self.reason,
            sender,
            receiver,
        }
    }
}
