//! Core types shared across the broker: identifiers, peer addressing,
//! heartbeat state, routing tables.

pub mod heartbeat;
pub mod peer;
pub mod routing;
pub mod types;
