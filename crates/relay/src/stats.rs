//! Traffic counters
//!
//! Written only by the event loop thread; atomics let a signal handler task
//! take a snapshot without stopping the loop.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Monotonic counters for the relay
#[derive(Debug, Default)]
pub struct Stats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped_send_fail: AtomicU64,
    dropped_queue_full: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dropped_send_fail: u64,
    pub dropped_queue_full: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A send was refused by the pacer or failed at the socket
    pub fn record_send_failure(&self) {
        self.dropped_send_fail.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued packet was evicted to make room
    pub fn record_queue_full(&self) {
        self.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_send_fail: self.dropped_send_fail.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
        }
    }

    /// Log all counters on one line
    pub fn dump(&self) {
        let s = self.snapshot();
        info!(
            "stats: pkt_sent={} pkt_recv={} bytes_sent={} bytes_recv={} drop_send_fail={} drop_queue_full={}",
            s.packets_sent,
            s.packets_received,
            s.bytes_sent,
            s.bytes_received,
            s.dropped_send_fail,
            s.dropped_queue_full,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(70);
        stats.record_send_failure();
        stats.record_queue_full();
        stats.record_queue_full();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                packets_sent: 2,
                packets_received: 1,
                bytes_sent: 150,
                bytes_received: 70,
                dropped_send_fail: 1,
                dropped_queue_full: 2,
            }
        );
    }

    #[test]
    fn test_fresh_stats_are_zero() {
        assert_eq!(Stats::new().snapshot(), StatsSnapshot::default());
    }
}
