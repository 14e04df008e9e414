use crossbeam_channel::{Sender, TrySendError};
use log::{debug, warn};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bound shared by every queue between the real-time path and its consumers.
pub const QUEUE_BOUND: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{queue} queue full ({bound} items), newest item dropped")]
pub struct QueueOverflow {
    pub queue: &'static str,
    pub bound: usize,
}

/// Non-blocking send that drops `item` when the queue is full.
///
/// Returns `false` when the item was not queued. Overflow is logged; a
/// disconnected consumer is not an error for the producer.
pub fn offer<T>(tx: &Sender<T>, item: T, queue: &'static str) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            let overflow = QueueOverflow {
                queue,
                bound: tx.capacity().unwrap_or(QUEUE_BOUND),
            };
            warn!("{}", overflow);
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            debug!("{} queue consumer gone, item dropped", queue);
            false
        }
    }
}

/// Join `handle` if it finishes within `timeout`; a late thread is left
/// running and reported.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration, what: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{} did not finish within {:?}", what, timeout);
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!("{} panicked", what);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn overflow_drops_the_newest_and_keeps_the_rest() {
        let (tx, rx) = bounded(3);
        for item in 0..3 {
            assert!(offer(&tx, item, "test"));
        }
        assert!(!offer(&tx, 99, "test"));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn disconnected_consumer_is_quiet() {
        let (tx, rx) = bounded(1);
        drop(rx);
        assert!(!offer(&tx, 1, "test"));
    }

    #[test]
    fn late_thread_is_not_waited_for() {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let _ = stop_rx.recv();
        });
        assert!(!join_with_timeout(handle, Duration::from_millis(20), "sleeper"));
        drop(stop_tx);

        let quick = std::thread::spawn(|| 1 + 1);
        assert!(join_with_timeout(quick, Duration::from_secs(1), "quick"));
    }
}
