use crate::models::ProgressEvent;
use tokio::sync::broadcast;

pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// Fan-out of a job's progress events. Publishing never blocks; a subscriber
/// that falls behind loses the oldest events, one that went away is ignored.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}
