//! The broker event loop
//!
//! One thread owns both sockets and all routing state. Each pass dispatches
//! everything that is currently ready, in a fixed order: control requests
//! first (so no routing decision runs against stale tables), then inbound
//! network traffic, then outbound client requests. Only when nothing was
//! ready does the loop block in a short poll on the two sockets; the poll
//! timeout doubles as the wakeup for queue-side work, which has no file
//! descriptor to wait on.
//!
//! Wire-level trouble never stops the loop: malformed frames are counted
//! and dropped, transient connect failures are logged and retried by the
//! heartbeat cycle. Only a routing-table inconsistency is fatal.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, TryRecvError};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::broker::control::{ControlRequest, UpdatePeersRequest};
use crate::broker::queues::{ClientEvent, ClientQueues, OutboundRequest};
use crate::broker::readiness::ReadySocket;
use crate::broker::stats::BrokerStats;
use crate::core::heartbeat::{now_ms, HealthTable};
use crate::core::peer::{resolve_connection_id, PeerId};
use crate::core::routing::RoutingTables;
use crate::core::types::{BrokerError, ClientId, MsgType, Result, Subscription, HEARTBEAT_TOPIC};

/// Outbound request wire layout: `[connection_id, "", msg_type, payload..]`.
/// The empty delimiter is what the remote DEALER/ROUTER pairing expects.
fn build_request_frames(
    connection_id: Vec<u8>,
    msg_type: &MsgType,
    payload: &[Vec<u8>],
) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(3 + payload.len());
    frames.push(connection_id);
    frames.push(Vec::new());
    frames.push(msg_type.as_bytes().to_vec());
    frames.extend(payload.iter().cloned());
    frames
}

/// Inbound reply layout mirrors the request: `[connection_id, "", msg_type,
/// payload..]`. None for anything that does not match.
fn parse_reply_frames(mut frames: Vec<Vec<u8>>) -> Option<(Vec<u8>, MsgType, Vec<Vec<u8>>)> {
    if frames.len() < 3 || !frames[1].is_empty() {
        return None;
    }
    let payload = frames.split_off(3);
    let msg_type = MsgType::from(frames.pop()?);
    frames.pop();
    let connection_id = frames.pop()?;
    Some((connection_id, msg_type, payload))
}

/// Publication layout: `[subscription_key, connection_id, payload..]`.
fn parse_publication_frames(
    mut frames: Vec<Vec<u8>>,
) -> Option<(Subscription, Vec<u8>, Vec<Vec<u8>>)> {
    if frames.len() < 2 {
        return None;
    }
    let payload = frames.split_off(2);
    let connection_id = frames.pop()?;
    let key = Subscription::from(frames.pop()?);
    Some((key, connection_id, payload))
}

/// Uniform choice over the ordered peer set. Modulo bias is tolerated;
/// this is load spreading, not cryptography.
fn pick_uniform<'a>(peers: &'a BTreeSet<PeerId>, rng: &mut StdRng) -> Option<&'a PeerId> {
    if peers.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..peers.len());
    peers.iter().nth(idx)
}

enum LoopStep {
    /// At least one source was ready and got dispatched.
    Busy,
    /// Nothing ready; block in the socket poll before the next pass.
    Idle,
    /// Shutdown requested or control channel gone.
    Stop,
}

pub(crate) struct Broker {
    router: ReadySocket,
    subscriber: ReadySocket,
    tables: RoutingTables<ClientQueues>,
    health: Arc<Mutex<HealthTable>>,
    control_rx: Receiver<ControlRequest>,
    peers_snapshot: Arc<RwLock<BTreeSet<PeerId>>>,
    stats: Arc<BrokerStats>,
    running: Arc<AtomicBool>,
    rng: StdRng,
    poll_tick_ms: i64,
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &zmq::Context,
        control_rx: Receiver<ControlRequest>,
        health: Arc<Mutex<HealthTable>>,
        peers_snapshot: Arc<RwLock<BTreeSet<PeerId>>>,
        stats: Arc<BrokerStats>,
        running: Arc<AtomicBool>,
        rng_seed: Option<u64>,
        poll_tick_ms: u64,
    ) -> Result<Self> {
        let router = ctx.socket(zmq::ROUTER)?;
        router.set_linger(0)?;
        // A send to an identity the socket has not handshaked yet must drop
        // silently, not error: the caller may name a peer that just left.
        router.set_router_mandatory(false)?;

        let subscriber = ctx.socket(zmq::SUB)?;
        subscriber.set_linger(0)?;
        subscriber.set_subscribe(HEARTBEAT_TOPIC)?;

        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            router: ReadySocket::new(router, "ROUTER"),
            subscriber: ReadySocket::new(subscriber, "SUB"),
            tables: RoutingTables::new(),
            health,
            control_rx,
            peers_snapshot,
            stats,
            running,
            rng,
            poll_tick_ms: poll_tick_ms.max(1) as i64,
        })
    }

    /// Run until shutdown. Returns an error only for a fatal table
    /// inconsistency; everything else is absorbed.
    pub fn run(&mut self) -> Result<()> {
        info!("[BROKER] event loop started");
        self.router.arm();
        self.subscriber.arm();

        while self.running.load(Ordering::Relaxed) {
            match self.pass() {
                Ok(LoopStep::Busy) => {}
                Ok(LoopStep::Idle) => {
                    if let Err(e) = self.wait_for_io() {
                        if is_socket_gone(&e) {
                            info!("[BROKER] context terminated, exiting");
                            break;
                        }
                        warn!("[BROKER] poll failed: {}", e);
                    }
                }
                Ok(LoopStep::Stop) => break,
                Err(e @ BrokerError::InvariantViolation(_)) => {
                    error!("[BROKER] fatal: {}", e);
                    return Err(e);
                }
                Err(e) if is_socket_gone(&e) => {
                    info!("[BROKER] socket gone, exiting");
                    break;
                }
                Err(e) => {
                    warn!("[BROKER] recoverable error, continuing: {}", e);
                }
            }
        }

        info!("[BROKER] event loop stopped");
        Ok(())
    }

    /// Dispatch everything currently ready, in deterministic order.
    fn pass(&mut self) -> Result<LoopStep> {
        let mut busy = false;

        loop {
            match self.control_rx.try_recv() {
                Ok(ControlRequest::Shutdown) => return Ok(LoopStep::Stop),
                Ok(request) => {
                    busy = true;
                    self.apply_control(request)?;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(LoopStep::Stop),
            }
        }

        // Readiness is edge-triggered over the whole queue: drain until the
        // socket reports not-ready, not just once per signal.
        while self.router.try_ready()? {
            let Some(frames) = self.router.recv_now()? else {
                break;
            };
            busy = true;
            self.deliver_reply(frames)?;
        }
        while self.subscriber.try_ready()? {
            let Some(frames) = self.subscriber.recv_now()? else {
                break;
            };
            busy = true;
            self.deliver_publication(frames)?;
        }

        if self.flush_client_requests()? {
            busy = true;
        }

        Ok(if busy { LoopStep::Busy } else { LoopStep::Idle })
    }

    fn apply_control(&mut self, request: ControlRequest) -> Result<()> {
        match request {
            ControlRequest::Register {
                client_id,
                msg_types,
                subs,
                queues,
            } => {
                info!(
                    "[BROKER] registering client {} ({} msg types, {} subscriptions)",
                    client_id,
                    msg_types.len(),
                    subs.len()
                );
                match self.tables.register(client_id, msg_types, subs, queues) {
                    Ok(fresh_keys) => {
                        for key in fresh_keys {
                            self.subscriber.inner().set_subscribe(key.as_bytes())?;
                            debug!("[BROKER] subscribed to {}", key);
                        }
                    }
                    Err((queues, err)) => {
                        warn!("[BROKER] {}", err);
                        let _ = queues.inbound.send(ClientEvent::Error(err));
                    }
                }
            }
            ControlRequest::Unregister { client_id } => match self.tables.unregister(&client_id) {
                Some((_queues, vacated)) => {
                    info!("[BROKER] unregistered client {}", client_id);
                    for key in vacated {
                        self.subscriber.inner().set_unsubscribe(key.as_bytes())?;
                        debug!("[BROKER] unsubscribed from {}", key);
                    }
                }
                None => warn!("[BROKER] unregister for unknown client {}", client_id),
            },
            ControlRequest::UpdatePeers(update) => self.apply_peer_update(update),
            ControlRequest::Reconnect { peers } => self.reconnect_peers(peers),
            ControlRequest::Shutdown => {}
        }
        Ok(())
    }

    fn apply_peer_update(&mut self, update: UpdatePeersRequest) {
        let (added, removed) = self.tables.apply_update(&update.add, &update.del);
        if added.is_empty() && removed.is_empty() {
            return;
        }

        for peer in &removed {
            // Best-effort: a failed disconnect only delays the TCP teardown.
            disconnect_logged(self.router.inner(), &peer.router_endpoint());
            disconnect_logged(self.subscriber.inner(), &peer.pub_endpoint());
        }
        for peer in &added {
            connect_logged(self.router.inner(), &peer.router_endpoint());
            connect_logged(self.subscriber.inner(), &peer.pub_endpoint());
        }

        let now = now_ms();
        {
            let mut health = self.health.lock();
            for peer in &removed {
                health.remove_peer(peer);
            }
            for peer in &added {
                health.insert_peer(peer.clone(), now);
            }
        }

        self.publish_peer_snapshot();
        info!(
            "[BROKER] peer set updated: +{} -{} ({} total)",
            added.len(),
            removed.len(),
            self.tables.peers.len()
        );
    }

    fn reconnect_peers(&mut self, peers: BTreeSet<PeerId>) {
        let now = now_ms();
        for peer in peers {
            if !self.tables.peers.contains(&peer) {
                debug!("[BROKER] reconnect for departed peer {}, skipping", peer);
                continue;
            }
            info!("[BROKER] reconnecting {}", peer);
            recycle_connection(self.router.inner(), &peer.router_endpoint());
            recycle_connection(self.subscriber.inner(), &peer.pub_endpoint());
            self.health.lock().apply_reconnect(&peer, now);
            self.stats.record_reconnect();
        }
    }

    fn deliver_reply(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        let frame_count = frames.len();
        let Some((connection_id, msg_type, payload)) = parse_reply_frames(frames) else {
            self.stats.record_dropped();
            warn!("[BROKER] dropping malformed {}-frame reply", frame_count);
            return Ok(());
        };

        let Some(peer) = resolve_connection_id(&self.tables.peers, &connection_id).cloned() else {
            self.stats.record_dropped();
            warn!(
                "[BROKER] dropping reply from unknown connection {}",
                String::from_utf8_lossy(&connection_id)
            );
            return Ok(());
        };

        // Any traffic from the peer counts as a heartbeat.
        self.health.lock().refresh(&peer);

        match self.tables.queue_for_msg(&msg_type)? {
            Some(queues) => {
                let owner_gone = queues
                    .inbound
                    .send(ClientEvent::Response {
                        peer,
                        msg_type: msg_type.clone(),
                        payload,
                    })
                    .is_err();
                if owner_gone {
                    debug!("[BROKER] owner of {} is gone, reply discarded", msg_type);
                } else {
                    self.stats.record_response();
                }
            }
            None => {
                self.stats.record_dropped();
                warn!("[BROKER] no owner for message type {}, dropping", msg_type);
            }
        }
        Ok(())
    }

    fn deliver_publication(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        let frame_count = frames.len();
        let Some((key, connection_id, payload)) = parse_publication_frames(frames) else {
            self.stats.record_dropped();
            warn!(
                "[BROKER] dropping malformed {}-frame publication",
                frame_count
            );
            return Ok(());
        };

        let Some(peer) = resolve_connection_id(&self.tables.peers, &connection_id).cloned() else {
            self.stats.record_dropped();
            warn!(
                "[BROKER] dropping publication from unknown connection {}",
                String::from_utf8_lossy(&connection_id)
            );
            return Ok(());
        };

        self.health.lock().refresh(&peer);

        if key.is_heartbeat() {
            self.stats.record_heartbeat();
            return Ok(());
        }

        let members: Vec<ClientId> = match self.tables.subscribers(&key) {
            Some(members) if members.is_empty() => {
                // A key with no members should have been unsubscribed and
                // removed; seeing traffic for it means the tables lie.
                return Err(BrokerError::InvariantViolation(format!(
                    "subscription {} has an empty subscriber set",
                    key
                )));
            }
            Some(members) => members.iter().cloned().collect(),
            None => {
                // In-flight frames can still arrive briefly after the last
                // subscriber left and the key was unsubscribed.
                self.stats.record_dropped();
                debug!("[BROKER] publication on unsubscribed key {}, dropping", key);
                return Ok(());
            }
        };

        for client_id in members {
            let Some(queues) = self.tables.client(&client_id) else {
                return Err(BrokerError::InvariantViolation(format!(
                    "subscriber {} of {} is not a registered client",
                    client_id, key
                )));
            };
            let delivered = queues
                .inbound
                .send(ClientEvent::Publication {
                    key: key.clone(),
                    peer: peer.clone(),
                    payload: payload.clone(),
                })
                .is_ok();
            if delivered {
                self.stats.record_publication();
            }
        }
        Ok(())
    }

    fn flush_client_requests(&mut self) -> Result<bool> {
        let mut work: Vec<(ClientId, OutboundRequest)> = Vec::new();
        for (client_id, queues) in self.tables.iter_clients() {
            while let Ok(request) = queues.outbound.try_recv() {
                work.push((client_id.clone(), request));
            }
        }

        let busy = !work.is_empty();
        for (client_id, request) in work {
            self.route_request(&client_id, request)?;
        }
        Ok(busy)
    }

    fn route_request(&mut self, client_id: &ClientId, request: OutboundRequest) -> Result<()> {
        let peer = match request.peer {
            Some(peer) => {
                if !self.tables.peers.contains(&peer) {
                    // Attempted anyway: the ROUTER drops it silently if the
                    // identity never handshaked.
                    warn!(
                        "[BROKER] client {} targets unknown peer {}, sending anyway",
                        client_id, peer
                    );
                }
                peer
            }
            None => match pick_uniform(&self.tables.peers, &mut self.rng) {
                Some(peer) => peer.clone(),
                None => {
                    warn!("[BROKER] client {} has no peers to send to", client_id);
                    if let Some(queues) = self.tables.client(client_id) {
                        let _ = queues.inbound.send(ClientEvent::Error(BrokerError::NoPeers));
                    }
                    return Ok(());
                }
            },
        };

        let frames = build_request_frames(peer.connection_id(), &request.msg_type, &request.payload);
        self.router.inner().send_multipart(frames, 0)?;
        self.stats.record_request();
        Ok(())
    }

    fn wait_for_io(&self) -> Result<()> {
        let mut items = [
            self.router.inner().as_poll_item(zmq::POLLIN),
            self.subscriber.inner().as_poll_item(zmq::POLLIN),
        ];
        zmq::poll(&mut items, self.poll_tick_ms)?;
        Ok(())
    }

    fn publish_peer_snapshot(&self) {
        *self.peers_snapshot.write() = self.tables.peers.clone();
    }
}

fn is_socket_gone(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::Zmq(zmq::Error::ETERM) | BrokerError::Zmq(zmq::Error::ENOTSOCK)
    )
}

fn connect_logged(socket: &zmq::Socket, endpoint: &str) {
    if let Err(e) = socket.connect(endpoint) {
        warn!("[BROKER] connect {} failed: {}", endpoint, e);
    }
}

fn disconnect_logged(socket: &zmq::Socket, endpoint: &str) {
    if let Err(e) = socket.disconnect(endpoint) {
        warn!("[BROKER] disconnect {} failed: {}", endpoint, e);
    }
}

/// Disconnect+connect is how ZMQ is forced into a fresh TCP handshake.
fn recycle_connection(socket: &zmq::Socket, endpoint: &str) {
    disconnect_logged(socket, endpoint);
    connect_logged(socket, endpoint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heartbeat::HealthLimits;
    use crossbeam::channel::unbounded;

    fn test_broker(ctx: &zmq::Context) -> (Broker, Arc<Mutex<HealthTable>>, Arc<RwLock<BTreeSet<PeerId>>>) {
        let health = Arc::new(Mutex::new(HealthTable::new(HealthLimits::default())));
        let snapshot = Arc::new(RwLock::new(BTreeSet::new()));
        let (_control_tx, control_rx) = unbounded();
        let broker = Broker::new(
            ctx,
            control_rx,
            Arc::clone(&health),
            Arc::clone(&snapshot),
            Arc::new(BrokerStats::default()),
            Arc::new(AtomicBool::new(true)),
            Some(1),
            10,
        )
        .unwrap();
        (broker, health, snapshot)
    }

    #[test]
    fn peer_updates_keep_health_table_in_lockstep() {
        let ctx = zmq::Context::new();
        let (mut broker, health, snapshot) = test_broker(&ctx);

        let a = PeerId::new("127.0.0.1", 18700, 18701);
        let b = PeerId::new("127.0.0.1", 18702, 18703);

        broker
            .apply_control(ControlRequest::UpdatePeers(UpdatePeersRequest::adding([
                a.clone(),
                b.clone(),
            ])))
            .unwrap();
        {
            let health = health.lock();
            assert_eq!(health.len(), 2);
            assert!(health.contains(&a));
            assert!(health.contains(&b));
        }
        assert_eq!(*snapshot.read(), broker.tables.peers);

        broker
            .apply_control(ControlRequest::UpdatePeers(UpdatePeersRequest::removing([
                a.clone(),
            ])))
            .unwrap();
        {
            let health = health.lock();
            assert_eq!(health.len(), 1);
            assert!(!health.contains(&a));
        }
        assert_eq!(*snapshot.read(), broker.tables.peers);
        assert!(snapshot.read().contains(&b));
    }

    #[test]
    fn request_frames_carry_delimiter_and_payload() {
        let frames = build_request_frames(
            b"tcp://host:7700".to_vec(),
            &MsgType::from("ping"),
            &[b"a".to_vec(), b"b".to_vec()],
        );
        assert_eq!(
            frames,
            vec![
                b"tcp://host:7700".to_vec(),
                Vec::new(),
                b"ping".to_vec(),
                b"a".to_vec(),
                b"b".to_vec(),
            ]
        );
    }

    #[test]
    fn reply_parse_round_trips_request_layout() {
        let frames = build_request_frames(
            b"tcp://host:7700".to_vec(),
            &MsgType::from("pong"),
            &[b"body".to_vec()],
        );
        let (conn, msg_type, payload) = parse_reply_frames(frames).unwrap();
        assert_eq!(conn, b"tcp://host:7700".to_vec());
        assert_eq!(msg_type, MsgType::from("pong"));
        assert_eq!(payload, vec![b"body".to_vec()]);
    }

    #[test]
    fn reply_parse_rejects_bad_layouts() {
        // Too short.
        assert!(parse_reply_frames(vec![b"id".to_vec(), Vec::new()]).is_none());
        // Missing delimiter.
        assert!(parse_reply_frames(vec![
            b"id".to_vec(),
            b"not-empty".to_vec(),
            b"t".to_vec()
        ])
        .is_none());
    }

    #[test]
    fn reply_with_empty_payload_is_valid() {
        let frames = vec![b"id".to_vec(), Vec::new(), b"ping".to_vec()];
        let (_, msg_type, payload) = parse_reply_frames(frames).unwrap();
        assert_eq!(msg_type, MsgType::from("ping"));
        assert!(payload.is_empty());
    }

    #[test]
    fn publication_parse_splits_key_and_sender() {
        let frames = vec![
            b"block".to_vec(),
            b"tcp://host:7700".to_vec(),
            b"payload".to_vec(),
        ];
        let (key, conn, payload) = parse_publication_frames(frames).unwrap();
        assert_eq!(key, Subscription::from("block"));
        assert_eq!(conn, b"tcp://host:7700".to_vec());
        assert_eq!(payload, vec![b"payload".to_vec()]);

        assert!(parse_publication_frames(vec![b"block".to_vec()]).is_none());
    }

    #[test]
    fn seeded_selection_spreads_evenly() {
        let peers: BTreeSet<PeerId> = (0..3u16).map(|n| PeerId::new("host", n, n + 100)).collect();
        let mut rng = StdRng::seed_from_u64(7);

        let mut counts = std::collections::HashMap::new();
        for _ in 0..3_000 {
            let peer = pick_uniform(&peers, &mut rng).unwrap();
            *counts.entry(peer.clone()).or_insert(0u32) += 1;
        }

        assert_eq!(counts.len(), 3);
        for (_, count) in counts {
            assert!((900..=1100).contains(&count), "skewed share: {}", count);
        }
    }

    #[test]
    fn selection_over_empty_set_is_none() {
        let peers = BTreeSet::new();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(pick_uniform(&peers, &mut rng).is_none());
    }

    #[test]
    fn same_seed_same_sequence() {
        let peers: BTreeSet<PeerId> = (0..5u16).map(|n| PeerId::new("host", n, n + 100)).collect();
        let picks = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32)
                .map(|_| pick_uniform(&peers, &mut rng).unwrap().clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(42), picks(42));
    }
}
