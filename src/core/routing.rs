//! Routing tables and their apply semantics
//!
//! Three routes are maintained: message type to owning client, subscription
//! key to subscriber set, and the ordered peer set itself. The tables are
//! generic over the per-client queue handle so they can be exercised
//! without any I/O attached.

use std::collections::{BTreeSet, HashMap};

use crate::core::peer::PeerId;
use crate::core::types::{BrokerError, ClientId, MsgType, Result, Subscription};

/// Normalize a peer-set update against the current set.
///
/// Peers named on both sides cancel out; additions already present and
/// deletions not present are discarded. The result is the exact set of
/// connects and disconnects the broker has to perform.
pub fn normalize_update(
    peers: &BTreeSet<PeerId>,
    add: &BTreeSet<PeerId>,
    del: &BTreeSet<PeerId>,
) -> (BTreeSet<PeerId>, BTreeSet<PeerId>) {
    let effective_add: BTreeSet<PeerId> = add
        .iter()
        .filter(|p| !del.contains(*p) && !peers.contains(*p))
        .cloned()
        .collect();
    let effective_del: BTreeSet<PeerId> = del
        .iter()
        .filter(|p| !add.contains(*p) && peers.contains(*p))
        .cloned()
        .collect();
    (effective_add, effective_del)
}

/// Broker-owned routing state. Only the broker thread mutates it.
pub struct RoutingTables<Q> {
    /// Current peer set, ordered so random selection is reproducible
    /// under a seeded RNG.
    pub peers: BTreeSet<PeerId>,
    clients: HashMap<ClientId, Q>,
    msg_owner: HashMap<MsgType, ClientId>,
    subs: HashMap<Subscription, BTreeSet<ClientId>>,
}

impl<Q> RoutingTables<Q> {
    pub fn new() -> Self {
        Self {
            peers: BTreeSet::new(),
            clients: HashMap::new(),
            msg_owner: HashMap::new(),
            subs: HashMap::new(),
        }
    }

    /// Register a client atomically.
    ///
    /// Fails whole if the client id is taken or any message type is already
    /// owned; no partial state is left behind in that case and the queue
    /// handle is returned to the caller. On success returns the
    /// subscription keys that were previously unknown (or empty) and now
    /// need a socket-level subscribe.
    pub fn register(
        &mut self,
        client_id: ClientId,
        msg_types: Vec<MsgType>,
        subs: Vec<Subscription>,
        queue: Q,
    ) -> std::result::Result<Vec<Subscription>, (Q, BrokerError)> {
        if self.clients.contains_key(&client_id) {
            return Err((
                queue,
                BrokerError::RegistrationRejected(format!("client {} already registered", client_id)),
            ));
        }
        if let Some(taken) = msg_types.iter().find(|m| self.msg_owner.contains_key(*m)) {
            return Err((
                queue,
                BrokerError::RegistrationRejected(format!(
                    "message type {} already owned by {}",
                    taken, self.msg_owner[taken]
                )),
            ));
        }

        for msg_type in msg_types {
            self.msg_owner.insert(msg_type, client_id.clone());
        }
        let mut fresh_keys = Vec::new();
        for key in subs {
            let members = self.subs.entry(key.clone()).or_default();
            if members.is_empty() {
                fresh_keys.push(key);
            }
            members.insert(client_id.clone());
        }
        self.clients.insert(client_id, queue);
        Ok(fresh_keys)
    }

    /// Remove a client along with its message-type ownerships and
    /// subscription memberships. Returns the queue handle and the keys
    /// whose subscriber set became empty (the broker unsubscribes those).
    pub fn unregister(&mut self, client_id: &ClientId) -> Option<(Q, Vec<Subscription>)> {
        let queue = self.clients.remove(client_id)?;
        self.msg_owner.retain(|_, owner| owner != client_id);

        let mut vacated = Vec::new();
        self.subs.retain(|key, members| {
            members.remove(client_id);
            if members.is_empty() {
                vacated.push(key.clone());
                false
            } else {
                true
            }
        });
        Some((queue, vacated))
    }

    /// Queue of the client owning `msg_type`, or None for an unknown type.
    ///
    /// An owner without a matching client entry means the two maps have
    /// drifted apart, which is fatal.
    pub fn queue_for_msg(&self, msg_type: &MsgType) -> Result<Option<&Q>> {
        let Some(owner) = self.msg_owner.get(msg_type) else {
            return Ok(None);
        };
        match self.clients.get(owner) {
            Some(queue) => Ok(Some(queue)),
            None => Err(BrokerError::InvariantViolation(format!(
                "message type {} owned by unregistered client {}",
                msg_type, owner
            ))),
        }
    }

    pub fn subscribers(&self, key: &Subscription) -> Option<&BTreeSet<ClientId>> {
        self.subs.get(key)
    }

    pub fn client(&self, client_id: &ClientId) -> Option<&Q> {
        self.clients.get(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn iter_clients(&self) -> impl Iterator<Item = (&ClientId, &Q)> {
        self.clients.iter()
    }

    /// Apply a normalized peer update and return (added, removed).
    pub fn apply_update(
        &mut self,
        add: &BTreeSet<PeerId>,
        del: &BTreeSet<PeerId>,
    ) -> (BTreeSet<PeerId>, BTreeSet<PeerId>) {
        let (effective_add, effective_del) = normalize_update(&self.peers, add, del);
        for peer in &effective_del {
            self.peers.remove(peer);
        }
        for peer in &effective_add {
            self.peers.insert(peer.clone());
        }
        (effective_add, effective_del)
    }
}

impl<Q> Default for RoutingTables<Q> {
    fn default() -> Self {
        Self::new()
    }
}
