//! Bounded drop-oldest hand-off between pipeline stages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    taken: AtomicUsize,
    dropped: AtomicUsize,
}

/// Snapshot of hand-off counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    pub pushed: usize,
    pub taken: usize,
    pub dropped: usize,
}

/// Create a hand-off holding at most `capacity` items. When full, a push evicts
/// the oldest queued item instead of blocking the producer.
pub fn handoff<T>(capacity: usize) -> (HandoffSender<T>, HandoffReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = flume::bounded(capacity);
    let stats = Arc::new(CachePadded::new(Stats::default()));

    (
        HandoffSender {
            tx,
            evict: rx.clone(),
            stats: stats.clone(),
        },
        HandoffReceiver { rx, stats },
    )
}

/// Producer side
pub struct HandoffSender<T> {
    tx: Sender<T>,
    /// Lets the producer pop the oldest entry on overflow
    evict: Receiver<T>,
    stats: Arc<CachePadded<Stats>>,
}

impl<T> HandoffSender<T> {
    /// Push an item, evicting the oldest one if the queue is full.
    ///
    /// Returns `true` when an older item was dropped to make room.
    pub fn push(&self, item: T) -> bool {
        let mut item = item;
        let mut evicted = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return evicted;
                }
                Err(TrySendError::Full(rejected)) => {
                    if self.evict.try_recv().is_ok() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                    item = rejected;
                }
                // Unreachable while `evict` is alive
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn stats(&self) -> HandoffStats {
        snapshot(&self.stats)
    }
}

/// Consumer side
pub struct HandoffReceiver<T> {
    rx: Receiver<T>,
    stats: Arc<CachePadded<Stats>>,
}

impl<T> HandoffReceiver<T> {
    /// Block until an item arrives. `None` once every sender is gone and the
    /// queue is drained.
    pub fn recv(&self) -> Option<T> {
        let item = self.rx.recv().ok()?;
        self.stats.taken.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let item = self.rx.recv_timeout(timeout)?;
        self.stats.taken.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    pub fn try_recv(&self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.stats.taken.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Take everything queued and keep only the newest item
    pub fn latest(&self) -> Option<T> {
        let mut newest = None;
        while let Some(item) = self.try_recv() {
            newest = Some(item);
        }
        newest
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> HandoffStats {
        snapshot(&self.stats)
    }
}

fn snapshot(stats: &Stats) -> HandoffStats {
    HandoffStats {
        pushed: stats.pushed.load(Ordering::Relaxed),
        taken: stats.taken.load(Ordering::Relaxed),
        dropped: stats.dropped.load(Ordering::Relaxed),
    }
}
