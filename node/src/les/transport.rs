//! Seams to the networking layer.

use super::peers::Peer;
use super::request::{ProtocolRequest, ProtocolResponse};
use super::{NodeRecord, PeerId};
use crate::chain::ChainHead;
use crate::metrics::TrafficMeters;
use async_trait::async_trait;
use eyre::Result;
use std::sync::Arc;

/// Sends protocol requests. Answers come back as [`NetworkEvent::Response`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: &Peer, request_id: u64, request: ProtocolRequest) -> Result<()>;
}

/// Opens a connection; a successful handshake surfaces as [`NetworkEvent::Connected`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, record: &NodeRecord) -> Result<()>;
}

/// Topic-based discovery of servers advertising the protocol.
#[async_trait]
pub trait TopicDiscovery: Send + Sync {
    async fn lookup(&self, topic: &str) -> Result<Vec<NodeRecord>>;
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub record: NodeRecord,
    pub version: u32,
    pub capacity: usize,
    pub head: ChainHead,
}

/// Everything the networking layer reports back to the client.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Connected(Handshake),
    Disconnected(PeerId),
    HeadAnnounced { peer: PeerId, head: ChainHead },
    Response {
        peer: PeerId,
        request_id: u64,
        response: ProtocolResponse,
    },
}

/// Counts outbound traffic before handing off to the wrapped transport.
pub struct MeteredTransport {
    inner: Arc<dyn Transport>,
    meters: Arc<TrafficMeters>,
}

impl MeteredTransport {
    pub fn new(inner: Arc<dyn Transport>, meters: Arc<TrafficMeters>) -> Self {
        Self { inner, meters }
    }
}

#[async_trait]
impl Transport for MeteredTransport {
    async fn send(&self, peer: &Peer, request_id: u64, request: ProtocolRequest) -> Result<()> {
        self.meters.egress.mark(request.wire_size());
        self.inner.send(peer, request_id, request).await
    }
}
