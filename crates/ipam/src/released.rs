//! Released notifications
//!
//! Bounded wake-up channel from an allocator to the loop that re-enqueues
//! pending claimers. Delivery is best effort: a full channel drops the
//! notification, the periodic resync picks up the slack.

use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of every released channel
pub const RELEASED_CHANNEL_CAPACITY: usize = 16;

/// Producer side, held by an allocator.
#[derive(Debug, Clone)]
pub struct ReleasedSender {
    tx: mpsc::Sender<()>,
}

/// Consumer side, drained by the released loop.
#[derive(Debug)]
pub struct ReleasedReceiver {
    rx: mpsc::Receiver<()>,
}

/// Create a bounded released channel.
pub fn channel() -> (ReleasedSender, ReleasedReceiver) {
    let (tx, rx) = mpsc::channel(RELEASED_CHANNEL_CAPACITY);
    (ReleasedSender { tx }, ReleasedReceiver { rx })
}

impl ReleasedSender {
    /// Signal that capacity was returned. Never blocks.
    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("Released channel full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!("Released channel closed, dropping notification");
            }
        }
    }
}

impl ReleasedReceiver {
    /// Wait for the next notification; `None` once every sender is gone.
    ///
    /// Notifications queued behind the first one are coalesced into it.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await?;
        self.drain();
        Some(())
    }

    /// Discard queued notifications, returning how many were pending.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}
