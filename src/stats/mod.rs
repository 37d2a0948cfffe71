//! Relay traffic accounting

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic byte counters shared across relay workers.
#[derive(Debug, Default)]
pub struct TrafficStats {
    tcp_in: AtomicU64,
    tcp_out: AtomicU64,
    udp_in: AtomicU64,
    udp_out: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed TCP exchange: bytes read from the target peer
    /// and bytes written back to it.
    pub fn add_tcp(&self, received: u64, sent: u64) {
        self.tcp_in.fetch_add(received, Ordering::Relaxed);
        self.tcp_out.fetch_add(sent, Ordering::Relaxed);
    }

    /// Record an inbound UDP datagram.
    pub fn add_udp_received(&self, n: u64) {
        self.udp_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a UDP response sent back to the peer.
    pub fn add_udp_sent(&self, n: u64) {
        self.udp_out.fetch_add(n, Ordering::Relaxed);
    }

    /// TCP (received, sent) byte totals.
    pub fn tcp(&self) -> (u64, u64) {
        (
            self.tcp_in.load(Ordering::Relaxed),
            self.tcp_out.load(Ordering::Relaxed),
        )
    }

    /// UDP (received, sent) byte totals.
    pub fn udp(&self) -> (u64, u64) {
        (
            self.udp_in.load(Ordering::Relaxed),
            self.udp_out.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = TrafficStats::new();
        stats.add_tcp(4, 4);
        stats.add_tcp(10, 2);
        assert_eq!(stats.tcp(), (14, 6));

        stats.add_udp_received(5);
        stats.add_udp_sent(5);
        assert_eq!(stats.udp(), (5, 5));

        // TCP and UDP counters are independent
        assert_eq!(stats.tcp(), (14, 6));
    }
}
