//! Transport abstraction consumed by the consensus core
//!
//! The core never touches sockets; it issues request/response calls and
//! topic publishes through [`Transport`] and learns peer protocol sets
//! through [`ProtocolProbe`]. The node crate provides the TCP-backed
//! implementation.

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::NetworkResult;
use crate::peer::PeerId;

/// Envelope framed onto the wire between two nodes.
///
/// Requests and responses are correlated by `request_id`; publishes are
/// fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportFrame {
    /// Connection opener: identity plus supported protocols and topics
    Hello {
        peer_id: PeerId,
        protocols: Vec<String>,
    },
    /// Protocol request
    Request {
        request_id: u64,
        protocol: String,
        payload: Vec<u8>,
    },
    /// Answer to a request, by id
    Response {
        request_id: u64,
        result: Result<Vec<u8>, String>,
    },
    /// Topic publish
    Publish { topic: String, payload: Vec<u8> },
    /// Graceful disconnect notification
    Disconnect { reason: String },
}

impl TransportFrame {
    /// Returns a short description of the frame type for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::Publish { .. } => "Publish",
            Self::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Peer-to-peer calling surface.
///
/// `call` resolves once the remote answers or the transport's own deadline
/// fires; the caller layers its policy timeouts on top. `publish` may
/// succeed with zero readers.
pub trait Transport: Send + Sync {
    /// The local node's peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Sends a request on `protocol` and awaits the peer's response bytes.
    fn call<'a>(
        &'a self,
        peer: PeerId,
        protocol: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, NetworkResult<Bytes>>;

    /// Publishes to a topic, fire-and-forget.
    fn publish<'a>(&'a self, topic: &'a str, payload: Bytes) -> BoxFuture<'a, NetworkResult<()>>;

    /// Snapshot of peers currently subscribed to a topic.
    fn get_topic_peers(&self, topic: &str) -> Vec<PeerId>;
}

/// One-shot interrogation of a peer's supported protocol list.
pub trait ProtocolProbe: Send + Sync {
    /// Asks the peer which protocols it speaks.
    fn probe(&self, peer: PeerId) -> BoxFuture<'_, NetworkResult<Vec<String>>>;
}
