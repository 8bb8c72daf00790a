//! Identifier types and the broker error taxonomy

use thiserror::Error;

/// Reserved publication topic carrying peer heartbeats.
///
/// The broker subscribes to it on startup and consumes every frame
/// internally; clients never see it.
pub const HEARTBEAT_TOPIC: &[u8] = b"_hb";

macro_rules! byte_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Vec<u8>);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_bytes(self) -> Vec<u8> {
                self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl From<&[u8]> for $name {
            fn from(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.as_bytes().to_vec())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", String::from_utf8_lossy(&self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), String::from_utf8_lossy(&self.0))
            }
        }
    };
}

byte_id! {
    /// Opaque identifier of an in-process client, unique within one broker.
    ClientId
}

byte_id! {
    /// First application frame of a request or response, identifying the RPC
    /// family. Exactly one client owns a message type at a time.
    MsgType
}

byte_id! {
    /// Publication topic key. Many clients may share one subscription.
    Subscription
}

impl Subscription {
    /// Whether this is the reserved heartbeat topic.
    pub fn is_heartbeat(&self) -> bool {
        self.0 == HEARTBEAT_TOPIC
    }
}

/// Errors surfaced by the broker and its facade.
///
/// Wire-level problems (malformed frames, transient connect failures) are
/// logged and absorbed by the event loop; they never appear here. Only
/// `InvariantViolation` terminates the loop.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Routing-table or heartbeat-table inconsistency. Fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Bad peer set or configuration, rejected before reaching the broker.
    #[error("configuration error: {0}")]
    Config(String),

    /// Client id already present, or a requested message type already owned.
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    /// Outbound send with no connected peers to choose from.
    #[error("no peers connected")]
    NoPeers,

    /// ZMQ socket or context error.
    #[error("ZMQ error: {0}")]
    Zmq(#[from] zmq::Error),

    /// The broker has shut down; queues are closed.
    #[error("broker terminated")]
    Terminated,
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ids_compare_and_display() {
        let a = MsgType::from("ping");
        let b = MsgType::from(b"ping".as_slice());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ping");
        assert_eq!(format!("{:?}", a), "MsgType(ping)");
    }

    #[test]
    fn heartbeat_topic_is_reserved() {
        assert!(Subscription::from("_hb").is_heartbeat());
        assert!(!Subscription::from("block").is_heartbeat());
    }

    #[test]
    fn non_utf8_ids_display_lossy() {
        let id = ClientId::from(vec![0xff, 0xfe]);
        assert!(!id.to_string().is_empty());
    }
}
