use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Samples held for a slow live-view consumer before new ones are dropped.
pub const LIVE_FEED_BOUND: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSample {
    pub frame: u64,
    pub values: Vec<u16>,
}

/// Best-effort copy of the sample stream for a live view. Never blocks the
/// control loop; a full queue drops the sample.
pub struct LiveFeed {
    tx: Sender<LiveSample>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl LiveFeed {
    pub fn channel(bound: usize) -> (Self, Receiver<LiveSample>) {
        let (tx, rx) = bounded(bound);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn push(&self, frame: u64, values: &[u16]) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let sample = LiveSample {
            frame,
            values: values.to_vec(),
        };
        match self.tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    debug!("live feed behind, {} samples dropped so far", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.closed.store(true, Ordering::Relaxed);
                info!("live view closed at frame {}", frame);
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
