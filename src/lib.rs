//! Client-side broker for a ZeroMQ RPC and publish/subscribe overlay
//!
//! Multiplexes many in-process clients over one ROUTER socket (request/reply
//! traffic to remote peers) and one SUB socket (publication traffic from
//! those peers), while a heartbeat ticker watches peer liveness and forces
//! reconnects with exponential backoff when a peer goes silent.
//!
//! # Architecture
//!
//! This crate follows a hybrid module structure:
//! - **`core/`**: Shared types, peer identity, heartbeat state, routing tables
//! - **`broker/`**: Socket ownership, the event loop, queues, the ticker
//!
//! The broker thread is the only thread that ever touches a socket. Client
//! workers talk to it through per-client duplex queues; the public facade
//! and the ticker talk to it through a single control queue.
//!
//! # Example
//!
//! ```no_run
//! use zmesh::{BrokerConfig, ClientEnv, GlobalEnv, OutboundRequest, PeerId};
//!
//! let global = GlobalEnv::new();
//! let peer = PeerId::new("10.0.0.7", 7700, 7701);
//! let env = ClientEnv::create(&global, BrokerConfig::default(), [peer.clone()]).unwrap();
//!
//! let broker = {
//!     let env = env.clone();
//!     std::thread::spawn(move || env.run_broker())
//! };
//!
//! let handle = env.register_client("wallet", ["balance"], ["block"]);
//! handle
//!     .send(OutboundRequest::to_peer(peer, "balance", vec![b"acct-7".to_vec()]))
//!     .unwrap();
//!
//! let reply = handle.recv().unwrap();
//! println!("{:?}", reply);
//!
//! env.terminate();
//! broker.join().unwrap().unwrap();
//! ```

pub mod broker;
pub mod core;

mod env;

pub use crate::core::heartbeat::{PeerHealth, INTERVAL_MAX_MS, INTERVAL_MIN_MS, LIVENESS_MAX};
pub use crate::core::peer::PeerId;
pub use crate::core::types::{BrokerError, ClientId, MsgType, Result, Subscription, HEARTBEAT_TOPIC};

pub use crate::broker::control::UpdatePeersRequest;
pub use crate::broker::queues::{ClientEvent, ClientHandle, OutboundRequest};
pub use crate::broker::stats::StatsSnapshot;

pub use crate::env::{BrokerConfig, ClientEnv, GlobalEnv};
