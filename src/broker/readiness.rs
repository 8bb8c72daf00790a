//! Socket readiness adapter
//!
//! Wraps a socket together with the question "would a receive block right
//! now?". ZMQ answers it through the ZMQ_EVENTS option rather than the
//! file descriptor, because the descriptor's readability is edge-triggered
//! over the aggregate of queued messages: after one readiness signal the
//! consumer must keep receiving until the socket reports not-ready, or
//! messages sit in the queue with no further edge to announce them.

use tracing::{debug, warn};

use crate::core::types::Result;

pub(crate) struct ReadySocket {
    socket: zmq::Socket,
    label: &'static str,
}

impl ReadySocket {
    pub fn new(socket: zmq::Socket, label: &'static str) -> Self {
        Self { socket, label }
    }

    /// Prime the readiness state with one non-blocking read. The events
    /// flag of a fresh socket is only trustworthy after a first receive
    /// attempt, so the broker arms both sockets before its first select.
    /// No peer is connected at that point; a frame here can only be stale.
    pub fn arm(&self) {
        match self.socket.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => {
                warn!(
                    "[{}] discarded {}-frame message received before startup",
                    self.label,
                    frames.len()
                );
            }
            Err(zmq::Error::EAGAIN) => {
                debug!("[{}] readiness armed", self.label);
            }
            Err(e) => {
                warn!("[{}] arming read failed: {}", self.label, e);
            }
        }
    }

    /// True iff a `recv` would not block.
    pub fn try_ready(&self) -> Result<bool> {
        Ok(self.socket.get_events()?.contains(zmq::POLLIN))
    }

    /// Non-blocking receive of one multipart message.
    pub fn recv_now(&self) -> Result<Option<Vec<Vec<u8>>>> {
        match self.socket.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => Ok(Some(frames)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn inner(&self) -> &zmq::Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconnected_socket_is_not_ready() {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::SUB).unwrap();
        let ready = ReadySocket::new(socket, "test-sub");
        ready.arm();
        assert!(!ready.try_ready().unwrap());
        assert!(ready.recv_now().unwrap().is_none());
    }

    #[test]
    fn becomes_ready_when_a_message_is_queued() {
        let ctx = zmq::Context::new();
        let push = ctx.socket(zmq::PUSH).unwrap();
        push.bind("inproc://readiness-test").unwrap();

        let pull = ctx.socket(zmq::PULL).unwrap();
        pull.connect("inproc://readiness-test").unwrap();
        let ready = ReadySocket::new(pull, "test-pull");
        ready.arm();

        push.send("hello", 0).unwrap();

        // inproc delivery is synchronous once both ends exist.
        assert!(ready.try_ready().unwrap());
        let frames = ready.recv_now().unwrap().unwrap();
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert!(!ready.try_ready().unwrap());
    }
}
