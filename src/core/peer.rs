//! Peer identity and TCP addressing
//!
//! A peer is a remote server reachable on two ports: a ROUTER port for
//! request/reply and a PUB port for publications. The ROUTER wire identity
//! of a peer (its connection id) is the UTF-8 encoding of its router
//! endpoint, so it can be derived on either side without negotiation.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::types::{BrokerError, Result};

/// ZMQ restricts routing identities to 1..=254 bytes.
const CONNECTION_ID_MAX_LEN: usize = 254;

/// Structural identity of a remote peer.
///
/// Ordering is total (host, then router port, then pub port) so that peer
/// sets iterate deterministically within a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub host: String,
    pub router_port: u16,
    pub pub_port: u16,
}

impl PeerId {
    pub fn new(host: impl Into<String>, router_port: u16, pub_port: u16) -> Self {
        Self {
            host: host.into(),
            router_port,
            pub_port,
        }
    }

    /// Endpoint of the peer's ROUTER socket.
    pub fn router_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.router_port)
    }

    /// Endpoint of the peer's PUB socket.
    pub fn pub_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.pub_port)
    }

    /// Wire identity the peer advertises on its ROUTER socket: the exact
    /// byte string found in frame 0 of every message it sends or receives.
    pub fn connection_id(&self) -> Vec<u8> {
        self.router_endpoint().into_bytes()
    }

    /// Check the derived connection id against the ZMQ identity limits.
    pub fn validate(&self) -> Result<()> {
        let id = self.connection_id();
        if id.is_empty() || id.len() > CONNECTION_ID_MAX_LEN {
            return Err(BrokerError::Config(format!(
                "peer {} has connection id of {} bytes (allowed 1..={})",
                self,
                id.len(),
                CONNECTION_ID_MAX_LEN
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.router_port, self.pub_port)
    }
}

/// Reject peer sets where two distinct peers derive the same connection id.
///
/// The connection id only covers host and router port, so two peers sharing
/// those but differing in pub port would be indistinguishable on the ROUTER
/// wire. Such configurations are refused outright.
pub fn check_connection_ids<'a>(peers: impl IntoIterator<Item = &'a PeerId>) -> Result<()> {
    let mut seen: HashMap<Vec<u8>, &PeerId> = HashMap::new();
    for peer in peers {
        peer.validate()?;
        if let Some(existing) = seen.insert(peer.connection_id(), peer) {
            if existing != peer {
                return Err(BrokerError::Config(format!(
                    "peers {} and {} share connection id {:?}",
                    existing,
                    peer,
                    String::from_utf8_lossy(&peer.connection_id())
                )));
            }
        }
    }
    Ok(())
}

/// Inverse lookup of a wire identity. Linear scan: peer sets stay small and
/// a second index could drift out of sync with the primary one.
pub fn resolve_connection_id<'a>(peers: &'a BTreeSet<PeerId>, id: &[u8]) -> Option<&'a PeerId> {
    peers.iter().find(|peer| peer.connection_id() == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_and_connection_id() {
        let peer = PeerId::new("node-1.example", 7700, 7701);
        assert_eq!(peer.router_endpoint(), "tcp://node-1.example:7700");
        assert_eq!(peer.pub_endpoint(), "tcp://node-1.example:7701");
        assert_eq!(peer.connection_id(), b"tcp://node-1.example:7700".to_vec());
        assert!(peer.validate().is_ok());
    }

    #[test]
    fn oversized_connection_id_rejected() {
        let peer = PeerId::new("h".repeat(300), 1, 2);
        assert!(matches!(peer.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn pub_port_collision_rejected() {
        let a = PeerId::new("host", 7700, 7701);
        let b = PeerId::new("host", 7700, 7801);
        let err = check_connection_ids([&a, &b]).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn duplicate_peer_is_not_a_collision() {
        let a = PeerId::new("host", 7700, 7701);
        let b = a.clone();
        assert!(check_connection_ids([&a, &b]).is_ok());
    }

    #[test]
    fn resolve_scans_peer_set() {
        let a = PeerId::new("a", 1, 2);
        let b = PeerId::new("b", 3, 4);
        let peers: BTreeSet<_> = [a.clone(), b.clone()].into();
        assert_eq!(resolve_connection_id(&peers, &b.connection_id()), Some(&b));
        assert_eq!(resolve_connection_id(&peers, b"tcp://c:9"), None);
    }

    #[test]
    fn peer_id_serde_round_trip() {
        let peer = PeerId::new("host", 7700, 7701);
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), peer);
    }
}
