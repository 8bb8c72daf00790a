//! Broker activity counters
//!
//! Cheap atomic counters the broker bumps as it routes; any thread can take
//! a consistent-enough snapshot for logging or tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct BrokerStats {
    requests_routed: AtomicU64,
    responses_delivered: AtomicU64,
    publications_delivered: AtomicU64,
    heartbeats_seen: AtomicU64,
    frames_dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl BrokerStats {
    pub fn record_request(&self) {
        self.requests_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publication(&self) {
        self.publications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_routed: self.requests_routed.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            publications_delivered: self.publications_delivered.load(Ordering::Relaxed),
            heartbeats_seen: self.heartbeats_seen.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Outbound requests written to the ROUTER socket.
    pub requests_routed: u64,
    /// Inbound ROUTER messages delivered to an owning client.
    pub responses_delivered: u64,
    /// Publication deliveries, counted once per receiving client.
    pub publications_delivered: u64,
    /// Heartbeat-topic frames consumed internally.
    pub heartbeats_seen: u64,
    /// Malformed or unroutable frames discarded.
    pub frames_dropped: u64,
    /// Peer reconnect cycles performed.
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let stats = BrokerStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_heartbeat();
        assert_eq!(stats.record_dropped(), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.requests_routed, 2);
        assert_eq!(snap.heartbeats_seen, 1);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.responses_delivered, 0);
    }
}
