//! Duplex queues pairing one client worker with the broker
//!
//! Each registered client holds a [`ClientHandle`]; the broker holds the
//! opposite endpoints. Both directions are unbounded FIFO channels, so
//! neither side can block the other. Dropping a handle closes the pair;
//! whatever was in flight is discarded.

use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::core::peer::PeerId;
use crate::core::types::{BrokerError, ClientId, MsgType, Result, Subscription};

/// An outbound request handed to the broker for delivery.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Target peer, or None to let the broker pick one at random.
    pub peer: Option<PeerId>,
    pub msg_type: MsgType,
    /// Opaque payload frames, appended verbatim to the wire message.
    pub payload: Vec<Vec<u8>>,
}

impl OutboundRequest {
    pub fn to_peer(peer: PeerId, msg_type: impl Into<MsgType>, payload: Vec<Vec<u8>>) -> Self {
        Self {
            peer: Some(peer),
            msg_type: msg_type.into(),
            payload,
        }
    }

    pub fn to_any(msg_type: impl Into<MsgType>, payload: Vec<Vec<u8>>) -> Self {
        Self {
            peer: None,
            msg_type: msg_type.into(),
            payload,
        }
    }
}

/// What a client worker receives from the broker.
#[derive(Debug)]
pub enum ClientEvent {
    /// A reply (or unsolicited message) for one of the client's owned
    /// message types.
    Response {
        peer: PeerId,
        msg_type: MsgType,
        payload: Vec<Vec<u8>>,
    },
    /// A publication on one of the client's subscribed topics.
    Publication {
        key: Subscription,
        peer: PeerId,
        payload: Vec<Vec<u8>>,
    },
    /// A broker-side failure tied to this client, e.g. an outbound send
    /// with no peers connected, or a rejected registration.
    Error(BrokerError),
}

/// Worker-side endpoint pair.
pub struct ClientHandle {
    client_id: ClientId,
    outbound: Sender<OutboundRequest>,
    inbound: Receiver<ClientEvent>,
}

impl ClientHandle {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Enqueue a request for the broker. Never blocks.
    pub fn send(&self, request: OutboundRequest) -> Result<()> {
        self.outbound
            .send(request)
            .map_err(|_| BrokerError::Terminated)
    }

    /// Block until the broker delivers the next event.
    pub fn recv(&self) -> Result<ClientEvent> {
        self.inbound.recv().map_err(|_| BrokerError::Terminated)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ClientEvent>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::Terminated),
        }
    }

    pub fn try_recv(&self) -> Result<Option<ClientEvent>> {
        match self.inbound.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BrokerError::Terminated),
        }
    }
}

/// Broker-side endpoint pair.
pub(crate) struct ClientQueues {
    pub outbound: Receiver<OutboundRequest>,
    pub inbound: Sender<ClientEvent>,
}

/// Build the duplex pair for one client.
pub(crate) fn client_channel(client_id: ClientId) -> (ClientHandle, ClientQueues) {
    let (out_tx, out_rx) = unbounded();
    let (in_tx, in_rx) = unbounded();
    (
        ClientHandle {
            client_id,
            outbound: out_tx,
            inbound: in_rx,
        },
        ClientQueues {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}
