//! Per-peer traffic counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-peer counters, updated by the packet workers.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub encrypt_errors: AtomicU64,
    pub decrypt_errors: AtomicU64,
    pub dropped: AtomicU64,
    pub keepalive_sent: AtomicU64,
    pub keepalive_recv: AtomicU64,
    pub exit_notify_recv: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub encrypt_errors: u64,
    pub decrypt_errors: u64,
    pub dropped: u64,
    pub keepalive_sent: u64,
    pub keepalive_recv: u64,
    pub exit_notify_recv: u64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            encrypt_errors: self.encrypt_errors.load(Ordering::Relaxed),
            decrypt_errors: self.decrypt_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            keepalive_sent: self.keepalive_sent.load(Ordering::Relaxed),
            keepalive_recv: self.keepalive_recv.load(Ordering::Relaxed),
            exit_notify_recv: self.exit_notify_recv.load(Ordering::Relaxed),
        }
    }

    pub fn count_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PeerStats::new();
        stats.count_tx(100);
        stats.count_tx(50);
        stats.count_rx(25);
        stats.dropped.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_bytes, 150);
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, 25);
        assert_eq!(snap.dropped, 1);
    }
}
