//! Scheduler wake-up signalling

use flume::{Receiver, Sender, TrySendError};

/// Event the capture side raises so the scheduler invokes delivery promptly
pub trait WakeSignal: Send + Sync {
    fn wake(&self);
}

/// Wake signal backed by a single-slot channel.
///
/// Repeated wakes before the scheduler drains the slot coalesce into one.
#[derive(Clone)]
pub struct ChannelWake {
    tx: Sender<()>,
}

impl ChannelWake {
    /// Create a wake signal and the receiver the scheduler waits on
    pub fn pair() -> (Self, Receiver<()>) {
        let (tx, rx) = flume::bounded(1);
        (Self { tx }, rx)
    }
}

impl WakeSignal for ChannelWake {
    fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("wake receiver dropped");
            }
        }
    }
}

/// Wake signal that does nothing, for pull-only consumers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWake;

impl WakeSignal for NoWake {
    fn wake(&self) {}
}
