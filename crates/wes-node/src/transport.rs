//! TCP transport realizing the consensus `Transport` trait
//!
//! One framed TCP connection per peer. Both sides open with a `Hello`
//! carrying identity and advertised protocols; requests and responses are
//! correlated by id, publishes fan out to every peer advertising the
//! topic. Protocol handlers are registered by the node before the
//! listener starts.

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use futures::FutureExt;
use futures::SinkExt;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use wes_network::message::{decode_payload, encode_payload, PROTOCOL_LIST_REQUEST};
use wes_network::{
    FrameCodec, NetworkError, NetworkResult, PeerId, ProtocolProbe, RoutingTable, Transport,
    TransportFrame,
};

/// Async request handler registered per protocol id.
pub type RequestHandler =
    Arc<dyn Fn(PeerId, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, String>> + Send + Sync>;

/// Handler invoked for every incoming topic publish.
pub type PublishHandler = Arc<dyn Fn(PeerId, String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

struct PeerHandle {
    tx: mpsc::Sender<TransportFrame>,
}

/// TCP-backed peer transport.
pub struct TcpTransport {
    local: PeerId,
    /// Protocols and topics advertised in our Hello
    advertised: Vec<String>,
    request_timeout: Duration,
    routing: Arc<RoutingTable>,
    peers: DashMap<PeerId, PeerHandle>,
    peer_protocols: DashMap<PeerId, Vec<String>>,
    pending: DashMap<u64, oneshot::Sender<Result<Vec<u8>, String>>>,
    next_request_id: AtomicU64,
    handlers: DashMap<String, RequestHandler>,
    publish_handler: RwLock<Option<PublishHandler>>,
    running: Arc<RwLock<bool>>,
}

impl TcpTransport {
    /// Creates the transport; handlers are registered before `start`.
    pub fn new(
        local: PeerId,
        advertised: Vec<String>,
        routing: Arc<RoutingTable>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            advertised,
            request_timeout,
            routing,
            peers: DashMap::new(),
            peer_protocols: DashMap::new(),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            handlers: DashMap::new(),
            publish_handler: RwLock::new(None),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Registers the handler for one protocol id.
    pub fn register_handler(&self, protocol: &str, handler: RequestHandler) {
        self.handlers.insert(protocol.to_string(), handler);
    }

    /// Registers the handler for incoming publishes.
    pub fn set_publish_handler(&self, handler: PublishHandler) {
        *self.publish_handler.write() = Some(handler);
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address (useful with port 0).
    pub async fn start(self: &Arc<Self>, listen_addr: SocketAddr) -> NetworkResult<SocketAddr> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?;
        info!(%bound, "transport listening");
        *self.running.write() = true;

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                if !*transport.running.read() {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted connection");
                        transport.spawn_connection(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(bound)
    }

    /// Dials a peer and runs the connection.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr, timeout: Duration) -> NetworkResult<()> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Codec(format!("dial to {} timed out", addr)))??;
        self.spawn_connection(stream);
        Ok(())
    }

    /// Stops accepting and drops all connections.
    pub async fn stop(&self) {
        *self.running.write() = false;
        let senders: Vec<mpsc::Sender<TransportFrame>> =
            self.peers.iter().map(|entry| entry.tx.clone()).collect();
        for tx in senders {
            let _ = tx
                .send(TransportFrame::Disconnect {
                    reason: "shutdown".to_string(),
                })
                .await;
        }
        self.peers.clear();
    }

    /// Currently connected peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream) {
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.run_connection(stream).await {
                debug!(error = %e, "connection closed");
            }
        });
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream) -> NetworkResult<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        // Symmetric handshake: both sides lead with Hello.
        writer
            .send(TransportFrame::Hello {
                peer_id: self.local,
                protocols: self.advertised.clone(),
            })
            .await?;

        let hello = tokio::time::timeout(Duration::from_secs(10), reader.next())
            .await
            .map_err(|_| NetworkError::Codec("timeout waiting for Hello".to_string()))?
            .ok_or_else(|| NetworkError::Codec("connection closed before Hello".to_string()))??;

        let (peer_id, protocols) = match hello {
            TransportFrame::Hello { peer_id, protocols } => (peer_id, protocols),
            other => {
                return Err(NetworkError::Codec(format!(
                    "expected Hello, got {}",
                    other.name()
                )))
            }
        };

        if peer_id == self.local {
            return Err(NetworkError::Codec("connected to self".to_string()));
        }
        if self.peers.contains_key(&peer_id) {
            debug!(peer = %peer_id.short_hex(), "duplicate connection dropped");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<TransportFrame>(64);
        self.peers.insert(peer_id, PeerHandle { tx: tx.clone() });
        self.peer_protocols.insert(peer_id, protocols.clone());
        self.routing.insert_peer_with_protocols(peer_id, protocols);
        info!(peer = %peer_id.short_hex(), "peer connected");

        let result = loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => {
                        if let TransportFrame::Disconnect { reason } = frame {
                            debug!(peer = %peer_id.short_hex(), %reason, "peer disconnected");
                            break Ok(());
                        }
                        self.handle_frame(peer_id, frame, &tx);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                outgoing = rx.recv() => match outgoing {
                    Some(frame) => {
                        let disconnect = matches!(frame, TransportFrame::Disconnect { .. });
                        if let Err(e) = writer.send(frame).await {
                            break Err(e);
                        }
                        if disconnect {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        self.peers.remove(&peer_id);
        self.peer_protocols.remove(&peer_id);
        info!(peer = %peer_id.short_hex(), "peer removed");
        result
    }

    fn handle_frame(
        self: &Arc<Self>,
        peer_id: PeerId,
        frame: TransportFrame,
        reply_tx: &mpsc::Sender<TransportFrame>,
    ) {
        match frame {
            TransportFrame::Request {
                request_id,
                protocol,
                payload,
            } => {
                // The protocol-list request is answered by the transport
                // itself; everything else goes to a registered handler.
                if protocol == PROTOCOL_LIST_REQUEST {
                    let result = encode_payload(&self.advertised)
                        .map_err(|e| e.to_string());
                    let reply = reply_tx.clone();
                    tokio::spawn(async move {
                        let _ = reply
                            .send(TransportFrame::Response { request_id, result })
                            .await;
                    });
                    return;
                }

                let Some(handler) = self.handlers.get(&protocol).map(|h| h.value().clone()) else {
                    let reply = reply_tx.clone();
                    tokio::spawn(async move {
                        let _ = reply
                            .send(TransportFrame::Response {
                                request_id,
                                result: Err(format!("unknown protocol {}", protocol)),
                            })
                            .await;
                    });
                    return;
                };

                let reply = reply_tx.clone();
                tokio::spawn(async move {
                    let result = handler(peer_id, payload).await;
                    let _ = reply
                        .send(TransportFrame::Response { request_id, result })
                        .await;
                });
            }
            TransportFrame::Response { request_id, result } => {
                if let Some((_, waiter)) = self.pending.remove(&request_id) {
                    let _ = waiter.send(result);
                } else {
                    debug!(request_id, "response for unknown request");
                }
            }
            TransportFrame::Publish { topic, payload } => {
                let handler = self.publish_handler.read().clone();
                if let Some(handler) = handler {
                    tokio::spawn(handler(peer_id, topic, payload));
                }
            }
            TransportFrame::Hello { peer_id, protocols } => {
                // Refreshed protocol advertisement mid-connection.
                self.peer_protocols.insert(peer_id, protocols.clone());
                self.routing.set_protocols(peer_id, protocols);
            }
            TransportFrame::Disconnect { .. } => {}
        }
    }
}

impl Transport for TcpTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn call<'a>(
        &'a self,
        peer: PeerId,
        protocol: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, NetworkResult<Bytes>> {
        async move {
            let tx = self
                .peers
                .get(&peer)
                .map(|h| h.tx.clone())
                .ok_or(NetworkError::PeerNotFound(peer))?;

            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let (waiter_tx, waiter_rx) = oneshot::channel();
            self.pending.insert(request_id, waiter_tx);

            let frame = TransportFrame::Request {
                request_id,
                protocol: protocol.to_string(),
                payload: payload.to_vec(),
            };
            if tx.send(frame).await.is_err() {
                self.pending.remove(&request_id);
                return Err(NetworkError::Unreachable(peer));
            }

            match tokio::time::timeout(self.request_timeout, waiter_rx).await {
                Ok(Ok(Ok(bytes))) => Ok(Bytes::from(bytes)),
                Ok(Ok(Err(message))) => Err(NetworkError::Remote { peer, message }),
                Ok(Err(_)) => Err(NetworkError::Unreachable(peer)),
                Err(_) => {
                    self.pending.remove(&request_id);
                    Err(NetworkError::Timeout {
                        peer,
                        protocol: protocol.to_string(),
                    })
                }
            }
        }
        .boxed()
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: Bytes) -> BoxFuture<'a, NetworkResult<()>> {
        async move {
            let subscribers: Vec<mpsc::Sender<TransportFrame>> = self
                .peer_protocols
                .iter()
                .filter(|entry| entry.value().iter().any(|p| p == topic))
                .filter_map(|entry| self.peers.get(entry.key()).map(|h| h.tx.clone()))
                .collect();

            for tx in subscribers {
                let _ = tx
                    .send(TransportFrame::Publish {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    })
                    .await;
            }
            Ok(())
        }
        .boxed()
    }

    fn get_topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.peer_protocols
            .iter()
            .filter(|entry| entry.value().iter().any(|p| p == topic))
            .map(|entry| *entry.key())
            .collect()
    }
}

impl ProtocolProbe for TcpTransport {
    fn probe(&self, peer: PeerId) -> BoxFuture<'_, NetworkResult<Vec<String>>> {
        async move {
            let response = self
                .call(peer, PROTOCOL_LIST_REQUEST, Bytes::new())
                .await?;
            decode_payload(&response)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wes_network::message::PROTOCOL_HEARTBEAT;

    fn peer(tag: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[31] = tag;
        PeerId::from_bytes(bytes)
    }

    fn transport(tag: u8, advertised: Vec<String>) -> Arc<TcpTransport> {
        let local = peer(tag);
        let routing = Arc::new(RoutingTable::new(local));
        TcpTransport::new(local, advertised, routing, Duration::from_secs(5))
    }

    async fn connected_pair(
        a_protocols: Vec<String>,
        b_protocols: Vec<String>,
    ) -> (Arc<TcpTransport>, Arc<TcpTransport>) {
        let a = transport(1, a_protocols);
        let b = transport(2, b_protocols);
        let addr = a.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        b.connect(addr, Duration::from_secs(5)).await.unwrap();
        // Give the handshake a moment.
        for _ in 0..50 {
            if !a.connected_peers().is_empty() && !b.connected_peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (a, b)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (a, b) = connected_pair(
            vec![PROTOCOL_HEARTBEAT.to_string()],
            vec![PROTOCOL_HEARTBEAT.to_string()],
        )
        .await;

        a.register_handler(
            PROTOCOL_HEARTBEAT,
            Arc::new(|_peer, payload| {
                async move {
                    let mut echoed = payload;
                    echoed.reverse();
                    Ok(echoed)
                }
                .boxed()
            }),
        );

        let response = b
            .call(peer(1), PROTOCOL_HEARTBEAT, Bytes::from(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(response.to_vec(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_remote_error() {
        let (_a, b) = connected_pair(Vec::new(), Vec::new()).await;
        let err = b
            .call(peer(1), "/weisyn/nonexistent/1.0.0", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_probe_returns_advertised_protocols() {
        let (_a, b) = connected_pair(
            vec![
                PROTOCOL_HEARTBEAT.to_string(),
                "weisyn.consensus.latest_block.v1".to_string(),
            ],
            Vec::new(),
        )
        .await;

        let protocols = b.probe(peer(1)).await.unwrap();
        assert!(protocols.iter().any(|p| p == PROTOCOL_HEARTBEAT));
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers() {
        let topic = "weisyn.consensus.latest_block.v1";
        let (a, b) = connected_pair(vec![topic.to_string()], vec![topic.to_string()]).await;

        let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(4);
        a.set_publish_handler(Arc::new(move |_peer, topic, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((topic, payload)).await;
            }
            .boxed()
        }));

        assert_eq!(b.get_topic_peers(topic), vec![peer(1)]);
        b.publish(topic, Bytes::from(vec![9, 9])).await.unwrap();

        let (got_topic, payload) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(got_topic, topic);
        assert_eq!(payload, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_call_unknown_peer_fails_fast() {
        let t = transport(7, Vec::new());
        let err = t
            .call(peer(8), PROTOCOL_HEARTBEAT, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotFound(_)));
    }
}
