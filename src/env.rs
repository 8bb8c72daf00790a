//! Public facade: environment creation, the broker entry point, and the
//! thread-safe operations callers use from outside the broker thread.
//!
//! Every mutating operation only enqueues a control request; the broker
//! applies it on its own thread. The one read that bypasses the queue is
//! `get_peers`, served from a snapshot cell the broker republishes on every
//! peer-set mutation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::control::{ControlRequest, UpdatePeersRequest};
use crate::broker::event_loop::Broker;
use crate::broker::queues::{client_channel, ClientEvent, ClientHandle};
use crate::broker::stats::{BrokerStats, StatsSnapshot};
use crate::broker::ticker::HeartbeatTicker;
use crate::core::heartbeat::{
    HealthLimits, HealthTable, INTERVAL_MAX_MS, INTERVAL_MIN_MS, LIVENESS_MAX,
};
use crate::core::peer::{check_connection_ids, PeerId};
use crate::core::types::{BrokerError, ClientId, MsgType, Result, Subscription};

/// Process-wide resources shared by broker instances: the ZMQ context.
///
/// Two brokers in one process may share a context or hold one each; both
/// layouts work because sockets never cross threads.
pub struct GlobalEnv {
    ctx: zmq::Context,
}

impl GlobalEnv {
    pub fn new() -> Self {
        Self {
            ctx: zmq::Context::new(),
        }
    }

    pub fn context(&self) -> &zmq::Context {
        &self.ctx
    }
}

impl Default for GlobalEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker tuning knobs. Defaults are production values; tests compress the
/// heartbeat timings to keep scenarios fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Socket poll timeout when nothing is ready, in milliseconds. Also
    /// bounds the latency of queue-side work, which the poll cannot see.
    pub poll_tick_ms: u64,
    /// Heartbeat ticker cadence in milliseconds (floored at 50).
    pub ticker_ms: u64,
    /// Initial/floor silence interval before liveness decrements.
    pub hb_interval_min_ms: i64,
    /// Backoff ceiling for the silence interval.
    pub hb_interval_max_ms: i64,
    /// Silent intervals tolerated before a peer is reconnected.
    pub hb_liveness_max: i64,
    /// Fixed RNG seed for peer selection; None draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_tick_ms: 10,
            ticker_ms: 50,
            hb_interval_min_ms: INTERVAL_MIN_MS,
            hb_interval_max_ms: INTERVAL_MAX_MS,
            hb_liveness_max: LIVENESS_MAX,
            rng_seed: None,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_tick_ms == 0 {
            return Err(BrokerError::Config("poll_tick_ms must be at least 1".into()));
        }
        if self.hb_interval_min_ms < 1 || self.hb_interval_max_ms < self.hb_interval_min_ms {
            return Err(BrokerError::Config(format!(
                "heartbeat intervals out of order: min {} max {}",
                self.hb_interval_min_ms, self.hb_interval_max_ms
            )));
        }
        if self.hb_liveness_max < 1 {
            return Err(BrokerError::Config("hb_liveness_max must be at least 1".into()));
        }
        Ok(())
    }

    fn health_limits(&self) -> HealthLimits {
        HealthLimits {
            interval_min_ms: self.hb_interval_min_ms,
            interval_max_ms: self.hb_interval_max_ms,
            liveness_max: self.hb_liveness_max,
        }
    }
}

struct EnvInner {
    ctx: zmq::Context,
    cfg: BrokerConfig,
    control_tx: Sender<ControlRequest>,
    control_rx: Receiver<ControlRequest>,
    health: Arc<Mutex<HealthTable>>,
    peers_snapshot: Arc<RwLock<BTreeSet<PeerId>>>,
    stats: Arc<BrokerStats>,
    running: Arc<AtomicBool>,
}

/// Handle on one broker instance. Cheap to clone; all clones address the
/// same broker.
#[derive(Clone)]
pub struct ClientEnv {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for ClientEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEnv").finish_non_exhaustive()
    }
}

impl ClientEnv {
    /// Validate the configuration and initial peer set and build the
    /// environment. The initial peers are handed to the broker as a
    /// pre-queued peer update, so they connect as soon as `run_broker`
    /// starts its loop.
    pub fn create(
        global: &GlobalEnv,
        cfg: BrokerConfig,
        initial_peers: impl IntoIterator<Item = PeerId>,
    ) -> Result<Self> {
        cfg.validate()?;
        let peers: BTreeSet<PeerId> = initial_peers.into_iter().collect();
        check_connection_ids(&peers)?;

        let (control_tx, control_rx) = unbounded();
        if !peers.is_empty() {
            control_tx
                .send(ControlRequest::UpdatePeers(UpdatePeersRequest::adding(
                    peers,
                )))
                .expect("control queue open at creation");
        }

        let health = Arc::new(Mutex::new(HealthTable::new(cfg.health_limits())));

        Ok(Self {
            inner: Arc::new(EnvInner {
                ctx: global.context().clone(),
                cfg,
                control_tx,
                control_rx,
                health,
                peers_snapshot: Arc::new(RwLock::new(BTreeSet::new())),
                stats: Arc::new(BrokerStats::default()),
                running: Arc::new(AtomicBool::new(true)),
            }),
        })
    }

    /// Run the broker on the calling thread until terminated. Spawn this on
    /// a dedicated thread; sockets are created here and never leave it.
    pub fn run_broker(&self) -> Result<()> {
        let inner = &self.inner;
        let mut broker = Broker::new(
            &inner.ctx,
            inner.control_rx.clone(),
            Arc::clone(&inner.health),
            Arc::clone(&inner.peers_snapshot),
            Arc::clone(&inner.stats),
            Arc::clone(&inner.running),
            inner.cfg.rng_seed,
            inner.cfg.poll_tick_ms,
        )?;

        let mut ticker = HeartbeatTicker::spawn(
            Arc::clone(&inner.health),
            inner.control_tx.clone(),
            Duration::from_millis(inner.cfg.ticker_ms),
        );

        let result = broker.run();
        ticker.stop();
        inner.running.store(false, Ordering::Relaxed);
        result
    }

    /// Register a client and hand back its duplex queue immediately.
    ///
    /// The handle is usable right away: requests sent before the broker
    /// applies the registration simply wait in the send queue. A rejected
    /// registration (duplicate client id or already-owned message type)
    /// arrives as a [`ClientEvent::Error`] on the handle.
    pub fn register_client(
        &self,
        client_id: impl Into<ClientId>,
        msg_types: impl IntoIterator<Item = impl Into<MsgType>>,
        subs: impl IntoIterator<Item = impl Into<Subscription>>,
    ) -> ClientHandle {
        let client_id = client_id.into();
        let (handle, queues) = client_channel(client_id.clone());
        let request = ControlRequest::Register {
            client_id,
            msg_types: msg_types.into_iter().map(Into::into).collect(),
            subs: subs.into_iter().map(Into::into).collect(),
            queues,
        };
        if let Err(send_err) = self.inner.control_tx.send(request) {
            warn!("[ENV] registration attempted after shutdown");
            if let ControlRequest::Register { queues, .. } = send_err.into_inner() {
                let _ = queues.inbound.send(ClientEvent::Error(BrokerError::Terminated));
            }
        }
        handle
    }

    /// Drop a client registration, releasing its message types and
    /// subscriptions. The client's handle goes silent once applied.
    pub fn unregister_client(&self, client_id: impl Into<ClientId>) {
        let _ = self.inner.control_tx.send(ControlRequest::Unregister {
            client_id: client_id.into(),
        });
    }

    /// Enqueue a peer-set change. Validation happens here so the caller
    /// gets the configuration error; the broker applies the change
    /// asynchronously.
    pub fn update_peers(&self, request: UpdatePeersRequest) -> Result<()> {
        // The future peer set must stay free of connection-id collisions.
        let current = self.get_peers();
        let outcome: BTreeSet<&PeerId> = current
            .iter()
            .filter(|p| !request.del.contains(*p))
            .chain(request.add.iter())
            .collect();
        check_connection_ids(outcome)?;

        self.inner
            .control_tx
            .send(ControlRequest::UpdatePeers(request))
            .map_err(|_| BrokerError::Terminated)
    }

    /// Snapshot of the current peer set.
    pub fn get_peers(&self) -> BTreeSet<PeerId> {
        self.inner.peers_snapshot.read().clone()
    }

    /// Point-in-time broker counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Stop the broker. Sockets close with linger 0 on the broker thread;
    /// pending control requests are dropped; registered clients observe the
    /// shutdown as closed queues.
    pub fn terminate(&self) {
        info!("[ENV] terminating broker");
        self.inner.running.store(false, Ordering::Relaxed);
        if self.inner.control_tx.send(ControlRequest::Shutdown).is_err() {
            debug!("[ENV] broker already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_intervals_rejected() {
        let cfg = BrokerConfig {
            hb_interval_min_ms: 5_000,
            hb_interval_max_ms: 1_000,
            ..BrokerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn create_rejects_colliding_initial_peers() {
        let global = GlobalEnv::new();
        let peers = [PeerId::new("h", 1, 2), PeerId::new("h", 1, 3)];
        let err = ClientEnv::create(&global, BrokerConfig::default(), peers).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn peer_snapshot_starts_empty() {
        let global = GlobalEnv::new();
        let env = ClientEnv::create(
            &global,
            BrokerConfig::default(),
            [PeerId::new("h", 1, 2)],
        )
        .unwrap();
        // The broker has not run yet, so the snapshot is still empty.
        assert!(env.get_peers().is_empty());
        assert!(env.is_running());
    }

    #[test]
    fn update_peers_validates_against_future_set() {
        let global = GlobalEnv::new();
        let env = ClientEnv::create(&global, BrokerConfig::default(), Vec::new()).unwrap();
        let err = env
            .update_peers(UpdatePeersRequest {
                add: [PeerId::new("h", 1, 2), PeerId::new("h", 1, 3)].into(),
                del: BTreeSet::new(),
            })
            .unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn config_serde_round_trip() {
        let cfg = BrokerConfig {
            rng_seed: Some(17),
            ..BrokerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BrokerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rng_seed, Some(17));
        assert_eq!(back.poll_tick_ms, cfg.poll_tick_ms);
    }
}
