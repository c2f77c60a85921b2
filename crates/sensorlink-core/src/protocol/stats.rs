//! Per-instance link counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters shared by the worker threads of one communicator.
#[derive(Debug, Default)]
pub(crate) struct LinkStats {
    pub tx_bytes: AtomicU64,
    pub tx_frames: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_frames: AtomicU64,
    pub decode_errors: AtomicU64,
    pub expired_requests: AtomicU64,
}

impl LinkStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, dropped_events: u64) -> StatsSnapshot {
        StatsSnapshot {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            expired_requests: self.expired_requests.load(Ordering::Relaxed),
            dropped_events,
        }
    }
}

/// Point-in-time copy of a communicator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes written to the transport.
    pub tx_bytes: u64,
    /// Frames written to the transport.
    pub tx_frames: u64,
    /// Bytes read from the transport.
    pub rx_bytes: u64,
    /// Complete frames decoded.
    pub rx_frames: u64,
    /// Corrupt frames skipped by the reassembler.
    pub decode_errors: u64,
    /// Requests resolved by the expiry sweep.
    pub expired_requests: u64,
    /// Callback events dropped because a dispatch queue was full.
    pub dropped_events: u64,
}
