//! WeiSyn Network
//!
//! Peer routing and wire protocol for the aggregation consensus layer.
//!
//! # Architecture
//!
//! - `PeerId`: 32-byte opaque peer identifier
//! - `RoutingTable`: Kademlia-style XOR-closest lookup with per-peer
//!   health scoring and protocol caching
//! - `message`: every record that crosses the wire, plus protocol ids
//! - `Transport`: the request/response + pub/sub surface the consensus
//!   core is written against
//! - `FrameCodec`: length-prefixed bincode framing for TCP transports

#![forbid(unsafe_code)]

mod codec;
mod error;
pub mod message;
mod peer;
mod routing;
mod transport;

pub use codec::FrameCodec;
pub use error::{NetworkError, NetworkResult};
pub use peer::PeerId;
pub use routing::{
    HealthState, PeerAnalysis, PeerType, ProtocolSupport, RoutingTable, SCORE_MAX, SCORE_MIN,
};
pub use transport::{ProtocolProbe, Transport, TransportFrame};
