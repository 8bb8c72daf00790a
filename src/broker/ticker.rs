//! Heartbeat ticker thread
//!
//! Scans the health table on a fixed cadence, decrements liveness for
//! silent peers, and tells the broker (through the control queue) which
//! peers need a reconnect. The ticker never touches a socket; every
//! socket-side effect is marshaled through the control queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::control::ControlRequest;
use crate::core::heartbeat::{now_ms, HealthTable};

/// Floor on the scan cadence; finer ticks buy nothing at 2 s intervals.
const MIN_TICK: Duration = Duration::from_millis(50);

pub(crate) struct HeartbeatTicker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatTicker {
    pub fn spawn(
        health: Arc<Mutex<HealthTable>>,
        control_tx: Sender<ControlRequest>,
        tick: Duration,
    ) -> Self {
        let tick = tick.max(MIN_TICK);
        let running = Arc::new(AtomicBool::new(true));
        let running_flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("zmesh-hb-ticker".to_string())
            .spawn(move || {
                debug!("[TICKER] started (tick: {:?})", tick);

                while running_flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);

                    if !running_flag.load(Ordering::Relaxed) {
                        break;
                    }

                    let expired = health.lock().tick(now_ms());
                    if expired.is_empty() {
                        continue;
                    }

                    warn!(
                        "[TICKER] {} peer(s) went silent, requesting reconnect",
                        expired.len()
                    );
                    let request = ControlRequest::Reconnect {
                        peers: expired.into_iter().collect(),
                    };
                    if control_tx.send(request).is_err() {
                        // Broker is gone; nothing left to drive.
                        break;
                    }
                }

                debug!("[TICKER] stopped");
            })
            .expect("Failed to spawn heartbeat ticker thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Signal the thread to stop and wait for it to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heartbeat::HealthLimits;
    use crate::core::peer::PeerId;
    use crossbeam::channel::unbounded;

    #[test]
    fn silent_peer_produces_one_reconnect_request() {
        let limits = HealthLimits {
            interval_min_ms: 60,
            interval_max_ms: 240,
            liveness_max: 2,
        };
        let health = Arc::new(Mutex::new(HealthTable::new(limits)));
        let peer = PeerId::new("host", 7700, 7701);
        health.lock().insert_peer(peer.clone(), now_ms());

        let (tx, rx) = unbounded();
        let mut ticker = HeartbeatTicker::spawn(Arc::clone(&health), tx, Duration::from_millis(50));

        // Two silent intervals of 60 ms each, plus scan slack.
        let request = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("reconnect request");
        match request {
            ControlRequest::Reconnect { peers } => assert!(peers.contains(&peer)),
            _ => panic!("expected reconnect request"),
        }
        assert!(health.lock().get(&peer).unwrap().inactive);

        // Inactive peers are not reported twice.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        ticker.stop();
    }

    #[test]
    fn stop_joins_the_thread() {
        let health = Arc::new(Mutex::new(HealthTable::new(HealthLimits::default())));
        let (tx, _rx) = unbounded();
        let mut ticker = HeartbeatTicker::spawn(health, tx, Duration::from_millis(50));
        ticker.stop();
        assert!(ticker.handle.is_none());
    }
}
