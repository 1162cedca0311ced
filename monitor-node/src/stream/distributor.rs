use std::time::Duration;

use tokio::sync::watch;
use vigil_common::{Frame, ReaderStatus};

/// In-process last-value frame broadcaster.
///
/// Holds a single frame slot; a publish atomically replaces it and wakes all
/// subscribers. Each subscriber observes a monotonic (possibly sparser)
/// subsequence of sequence numbers and can never backpressure the reader.
#[derive(Debug)]
pub struct FrameDistributor {
    frame_tx: watch::Sender<Option<Frame>>,
    status_tx: watch::Sender<ReaderStatus>,
}

impl FrameDistributor {
    pub fn new() -> Self {
        let (frame_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(ReaderStatus::Connecting);
        Self {
            frame_tx,
            status_tx,
        }
    }

    pub fn publish(&self, frame: Frame) {
        // send_replace never fails even with no live subscribers.
        self.frame_tx.send_replace(Some(frame));
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.frame_tx.subscribe(),
        }
    }

    /// Snapshot of the current slot; empty during the first moments of a
    /// session and after a status reset.
    pub fn latest(&self) -> Option<Frame> {
        self.frame_tx.borrow().clone()
    }

    pub fn set_status(&self, status: ReaderStatus) {
        self.status_tx.send_replace(status);
    }

    pub fn status(&self) -> ReaderStatus {
        *self.status_tx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ReaderStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.frame_tx.receiver_count()
    }
}

impl Default for FrameDistributor {
    fn default() -> Self {
        Self::new()
    }
}

/// A lossy single-slot mailbox over the distributor's frame slot.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<Option<Frame>>,
}

impl Subscription {
    /// Wait for the next unseen frame, or `None` on timeout / publisher gone.
    pub async fn next(&mut self, timeout: Duration) -> Option<Frame> {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }

    pub fn latest(&self) -> Option<Frame> {
        self.rx.borrow().clone()
    }
}
