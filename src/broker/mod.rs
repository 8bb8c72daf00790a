//! Socket ownership and the broker event loop
//!
//! Everything that touches a ZMQ socket lives here, confined to the single
//! thread that runs [`event_loop::Broker::run`]. The other submodules are
//! the plumbing around it: client duplex queues, the control channel, the
//! readiness adapter, counters, and the heartbeat ticker thread.

pub mod control;
pub mod event_loop;
pub mod queues;
pub mod readiness;
pub mod stats;
pub mod ticker;
