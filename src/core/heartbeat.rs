//! Per-peer liveness tracking
//!
//! Liveness is driven entirely by received traffic: every frame from a peer
//! (request/reply or publication, including the heartbeat topic) resets its
//! counter. The ticker decrements the counter once per interval of silence;
//! when it hits bottom the peer is marked for reconnection and its interval
//! doubles, up to a ceiling, so a dead peer cannot trigger reconnect storms.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::peer::PeerId;

/// Initial (and floor) silence interval before liveness is decremented.
pub const INTERVAL_MIN_MS: i64 = 2_000;

/// Backoff ceiling for the silence interval.
pub const INTERVAL_MAX_MS: i64 = 32_000;

/// Number of silent intervals tolerated before a peer is declared dead.
pub const LIVENESS_MAX: i64 = 5;

/// Current POSIX time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Tunable liveness limits. Defaults match the wire constants; tests
/// compress them to keep scenarios fast.
#[derive(Debug, Clone, Copy)]
pub struct HealthLimits {
    pub interval_min_ms: i64,
    pub interval_max_ms: i64,
    pub liveness_max: i64,
}

impl Default for HealthLimits {
    fn default() -> Self {
        Self {
            interval_min_ms: INTERVAL_MIN_MS,
            interval_max_ms: INTERVAL_MAX_MS,
            liveness_max: LIVENESS_MAX,
        }
    }
}

/// Liveness state of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHealth {
    /// Current silence interval; doubles on every reconnect, saturating.
    pub interval_ms: i64,
    /// Remaining silent intervals before a reconnect is forced.
    pub liveness: i64,
    /// Earliest time (POSIX ms) the ticker may decrement liveness again.
    pub next_poll_ms: i64,
    /// Set while a reconnect is in flight so the ticker leaves the peer alone.
    pub inactive: bool,
}

/// Liveness table for the current peer set.
///
/// Its key set always equals the broker's peer set; both are mutated
/// together when a peer-set update is applied.
#[derive(Debug)]
pub struct HealthTable {
    limits: HealthLimits,
    entries: HashMap<PeerId, PeerHealth>,
}

impl HealthTable {
    pub fn new(limits: HealthLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
        }
    }

    /// Track a newly connected peer. The first poll is deferred by one full
    /// interval to give the sockets time to finish connecting.
    pub fn insert_peer(&mut self, peer: PeerId, now_ms: i64) {
        self.entries.insert(
            peer,
            PeerHealth {
                interval_ms: self.limits.interval_min_ms,
                liveness: self.limits.liveness_max,
                next_poll_ms: now_ms + self.limits.interval_min_ms,
                inactive: false,
            },
        );
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    /// Traffic seen from `peer`: restore full liveness and the floor
    /// interval. The poll deadline is left untouched. Returns false if the
    /// peer is not tracked.
    pub fn refresh(&mut self, peer: &PeerId) -> bool {
        match self.entries.get_mut(peer) {
            Some(health) => {
                health.liveness = self.limits.liveness_max;
                health.interval_ms = self.limits.interval_min_ms;
                true
            }
            None => false,
        }
    }

    /// One ticker pass. Decrements liveness for every active peer whose poll
    /// deadline has passed and returns the peers that just ran out, already
    /// marked inactive so they are not reported twice.
    pub fn tick(&mut self, now_ms: i64) -> Vec<PeerId> {
        let mut expired = Vec::new();
        for (peer, health) in self.entries.iter_mut() {
            if health.inactive || now_ms < health.next_poll_ms {
                continue;
            }
            if health.liveness > 1 {
                health.liveness -= 1;
                health.next_poll_ms = now_ms + health.interval_ms;
            } else {
                health.inactive = true;
                expired.push(peer.clone());
            }
        }
        expired
    }

    /// The broker finished reconnecting `peer`: double the interval
    /// (saturating at the ceiling) and re-arm the ticker.
    pub fn apply_reconnect(&mut self, peer: &PeerId, now_ms: i64) {
        if let Some(health) = self.entries.get_mut(peer) {
            health.interval_ms = (health.interval_ms * 2).min(self.limits.interval_max_ms);
            health.inactive = false;
            health.next_poll_ms = now_ms + health.interval_ms;
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerHealth> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HealthLimits {
        HealthLimits {
            interval_min_ms: 100,
            interval_max_ms: 400,
            liveness_max: 3,
        }
    }

    fn peer() -> PeerId {
        PeerId::new("host", 7700, 7701)
    }

    #[test]
    fn silence_runs_liveness_down_in_exactly_max_ticks() {
        let mut table = HealthTable::new(limits());
        let mut now = 0;
        table.insert_peer(peer(), now);

        // First deadline is one full interval out.
        now += 100;
        assert!(table.tick(now).is_empty());
        assert_eq!(table.get(&peer()).unwrap().liveness, 2);

        now += 100;
        assert!(table.tick(now).is_empty());
        assert_eq!(table.get(&peer()).unwrap().liveness, 1);

        now += 100;
        let expired = table.tick(now);
        assert_eq!(expired, vec![peer()]);
        assert!(table.get(&peer()).unwrap().inactive);

        // Inactive peers are not reported again.
        now += 100;
        assert!(table.tick(now).is_empty());
    }

    #[test]
    fn traffic_restores_liveness_and_interval() {
        let mut table = HealthTable::new(limits());
        table.insert_peer(peer(), 0);
        table.tick(100);
        table.tick(200);
        assert_eq!(table.get(&peer()).unwrap().liveness, 1);

        assert!(table.refresh(&peer()));
        let health = table.get(&peer()).unwrap();
        assert_eq!(health.liveness, 3);
        assert_eq!(health.interval_ms, 100);
        // Deadline unchanged by traffic.
        assert_eq!(health.next_poll_ms, 300);
    }

    #[test]
    fn tick_before_deadline_is_a_no_op() {
        let mut table = HealthTable::new(limits());
        table.insert_peer(peer(), 0);
        assert!(table.tick(99).is_empty());
        assert_eq!(table.get(&peer()).unwrap().liveness, 3);
    }

    #[test]
    fn reconnect_backoff_doubles_and_saturates() {
        let mut table = HealthTable::new(limits());
        table.insert_peer(peer(), 0);

        table.apply_reconnect(&peer(), 0);
        assert_eq!(table.get(&peer()).unwrap().interval_ms, 200);
        table.apply_reconnect(&peer(), 0);
        assert_eq!(table.get(&peer()).unwrap().interval_ms, 400);
        table.apply_reconnect(&peer(), 0);
        assert_eq!(table.get(&peer()).unwrap().interval_ms, 400);
        assert!(!table.get(&peer()).unwrap().inactive);
    }

    #[test]
    fn refresh_after_reconnect_resets_interval_to_floor() {
        let mut table = HealthTable::new(limits());
        table.insert_peer(peer(), 0);
        table.apply_reconnect(&peer(), 0);
        table.apply_reconnect(&peer(), 0);
        table.refresh(&peer());
        assert_eq!(table.get(&peer()).unwrap().interval_ms, 100);
    }

    #[test]
    fn removed_peer_is_forgotten() {
        let mut table = HealthTable::new(limits());
        table.insert_peer(peer(), 0);
        table.remove_peer(&peer());
        assert!(!table.refresh(&peer()));
        assert!(table.is_empty());
    }
}
