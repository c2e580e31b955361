use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-destination counters.
///
/// `enqueues - dequeues - expired == messages` holds whenever the queue is
/// quiescent.
#[derive(Debug, Default)]
pub struct DestinationStatistics {
    pub enqueues: AtomicU64,
    pub dequeues: AtomicU64,
    pub expired: AtomicU64,
    /// Gauge of messages held by the destination (pending plus in flight).
    pub messages: AtomicU64,
    pub dispatched: AtomicU64,
    /// Gauge of dispatched, unacknowledged messages.
    pub inflight: AtomicU64,
    pub redelivered: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub blocked_sends: AtomicU64,
    pub consumers: AtomicU64,
}

/// Serializable snapshot of destination statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStatisticsSnapshot {
    pub enqueues: u64,
    pub dequeues: u64,
    pub expired: u64,
    pub messages: u64,
    pub dispatched: u64,
    pub inflight: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub blocked_sends: u64,
    pub consumers: u64,
}

impl DestinationStatistics {
    pub fn snapshot(&self) -> DestinationStatisticsSnapshot {
        DestinationStatisticsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            dequeues: self.dequeues.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            blocked_sends: self.blocked_sends.load(Ordering::Relaxed),
            consumers: self.consumers.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement for gauges.
    #[inline]
    pub fn decrement(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }
}

impl DestinationStatisticsSnapshot {
    /// Whether the enqueue/dequeue/expiry counters account for every
    /// message still held.
    pub fn is_balanced(&self) -> bool {
        self.enqueues
            .checked_sub(self.dequeues)
            .and_then(|v| v.checked_sub(self.expired))
            == Some(self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters_and_balance() {
        let stats = DestinationStatistics::default();
        for _ in 0..3 {
            DestinationStatistics::increment(&stats.enqueues);
            DestinationStatistics::increment(&stats.messages);
        }
        DestinationStatistics::increment(&stats.dequeues);
        DestinationStatistics::decrement(&stats.messages);
        DestinationStatistics::increment(&stats.expired);
        DestinationStatistics::decrement(&stats.messages);

        let snap = stats.snapshot();
        assert_eq!(snap.messages, 1);
        assert!(snap.is_balanced());

        DestinationStatistics::decrement(&stats.messages);
        DestinationStatistics::decrement(&stats.messages);
        assert_eq!(stats.snapshot().messages, 0);
        assert!(!stats.snapshot().is_balanced());
    }
}
