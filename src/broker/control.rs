//! Control requests feeding the broker
//!
//! One unbounded MPSC channel carries every state mutation: the public
//! facade enqueues registrations and peer updates, the ticker enqueues
//! reconnects. Only the broker thread dequeues, so table mutation and
//! socket work always happen on the owning thread.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::broker::queues::ClientQueues;
use crate::core::peer::PeerId;
use crate::core::types::{ClientId, MsgType, Subscription};

/// Peer-set change request. Overlapping and already-known entries are
/// normalized away before application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePeersRequest {
    pub add: BTreeSet<PeerId>,
    pub del: BTreeSet<PeerId>,
}

impl UpdatePeersRequest {
    pub fn adding(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            add: peers.into_iter().collect(),
            del: BTreeSet::new(),
        }
    }

    pub fn removing(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            add: BTreeSet::new(),
            del: peers.into_iter().collect(),
        }
    }
}

pub(crate) enum ControlRequest {
    Register {
        client_id: ClientId,
        msg_types: Vec<MsgType>,
        subs: Vec<Subscription>,
        queues: ClientQueues,
    },
    Unregister {
        client_id: ClientId,
    },
    UpdatePeers(UpdatePeersRequest),
    Reconnect {
        peers: BTreeSet<PeerId>,
    },
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_serde_round_trip() {
        let req = UpdatePeersRequest {
            add: [PeerId::new("a", 1, 2)].into(),
            del: [PeerId::new("b", 3, 4)].into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: UpdatePeersRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.add, req.add);
        assert_eq!(back.del, req.del);
    }
}
