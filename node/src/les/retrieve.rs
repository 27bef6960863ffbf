//! Attempt lifecycle for one logical retrieval.
//!
//! Each attempt reserves a peer slot, registers a pending entry keyed by
//! request id, sends, and waits for the networking layer to deliver the
//! matching answer. Failed peers are excluded for the rest of the
//! retrieval, so the number of attempts is bounded by the eligible peers.

use super::distributor::{CanSend, RequestDistributor};
use super::peers::{Peer, PeerSet, PeerSetObserver};
use super::request::{OdrRequest, ProtocolResponse};
use super::server_pool::{ConnectionOutcome, ServerPool};
use super::transport::Transport;
use super::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrieveError {
    #[error("no eligible peers available")]
    NoPeersAvailable,
    #[error("request timed out")]
    Timeout,
    #[error("response failed validation: {0}")]
    ValidationFailed(String),
    #[error("retrieval canceled")]
    Canceled,
}

#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    /// Time one peer has to answer.
    pub attempt_timeout: Duration,
    /// Time to wait for an eligible peer before giving up.
    pub retrieve_timeout: Duration,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            retrieve_timeout: Duration::from_secs(30),
        }
    }
}

/// A verified answer and the peer that served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved<T> {
    pub value: T,
    pub peer: PeerId,
}

enum AttemptEvent {
    Response(ProtocolResponse),
    PeerDropped,
}

struct PendingAttempt {
    peer: PeerId,
    tx: oneshot::Sender<AttemptEvent>,
}

enum AttemptResult<T> {
    Done(T),
    Failed,
    Canceled,
}

pub struct RetrieveManager {
    config: RetrieveConfig,
    peers: Arc<PeerSet>,
    distributor: Arc<RequestDistributor>,
    pool: Arc<ServerPool>,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, PendingAttempt>>,
    next_id: AtomicU64,
    quit: watch::Receiver<bool>,
}

impl RetrieveManager {
    pub fn new(
        config: RetrieveConfig,
        peers: Arc<PeerSet>,
        distributor: Arc<RequestDistributor>,
        pool: Arc<ServerPool>,
        transport: Arc<dyn Transport>,
        quit: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            peers: Arc::clone(&peers),
            distributor,
            pool,
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            quit,
        });
        let observer: Arc<dyn PeerSetObserver> = manager.clone();
        peers.subscribe(Arc::downgrade(&observer));
        manager
    }

    /// Retrieve and verify `request`, trying peers until one answers validly.
    pub async fn retrieve<R: OdrRequest>(
        &self,
        request: R,
    ) -> Result<Retrieved<R::Output>, RetrieveError> {
        let request = Arc::new(request);
        let kind = request.message().name();
        let deadline = Instant::now() + self.config.retrieve_timeout;
        let mut excluded: HashSet<PeerId> = HashSet::new();
        let mut quit = self.quit.clone();

        loop {
            if *quit.borrow() {
                return Err(RetrieveError::Canceled);
            }
            if !excluded.is_empty() && !self.has_candidate(request.as_ref(), &excluded) {
                debug!(kind, attempted = excluded.len(), "eligible peers exhausted");
                return Err(RetrieveError::NoPeersAvailable);
            }

            let can_send: CanSend = {
                let request = Arc::clone(&request);
                let excluded = excluded.clone();
                Box::new(move |peer: &Peer| !excluded.contains(&peer.id) && request.can_send(peer))
            };
            let slot = tokio::select! {
                slot = self.distributor.distribute(can_send, deadline) => slot?,
                _ = quit.changed() => return Err(RetrieveError::Canceled),
            };
            let peer = Arc::clone(slot.peer());

            match self.attempt(request.as_ref(), &peer, &mut quit).await {
                AttemptResult::Done(value) => {
                    return Ok(Retrieved {
                        value,
                        peer: peer.id,
                    })
                }
                AttemptResult::Failed => {
                    excluded.insert(peer.id);
                }
                AttemptResult::Canceled => return Err(RetrieveError::Canceled),
            }
            drop(slot);
        }
    }

    fn has_candidate<R: OdrRequest>(&self, request: &R, excluded: &HashSet<PeerId>) -> bool {
        self.peers
            .snapshot()
            .iter()
            .any(|peer| !excluded.contains(&peer.id) && request.can_send(peer))
    }

    async fn attempt<R: OdrRequest>(
        &self,
        request: &R,
        peer: &Arc<Peer>,
        quit: &mut watch::Receiver<bool>,
    ) -> AttemptResult<R::Output> {
        let message = request.message();
        let kind = message.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id, PendingAttempt { peer: peer.id, tx });
        // The peer may have left between dispatch and registration.
        if !self.peers.contains(&peer.id) {
            self.pending.lock().remove(&id);
            return AttemptResult::Failed;
        }

        let started = Instant::now();
        if let Err(err) = self.transport.send(peer, id, message).await {
            self.pending.lock().remove(&id);
            debug!(kind, request_id = id, peer_id = %peer.id, error = %err, "send failed");
            return AttemptResult::Failed;
        }
        trace!(kind, request_id = id, peer_id = %peer.id, "request sent");

        let event = tokio::select! {
            event = rx => event.ok(),
            _ = sleep(self.config.attempt_timeout) => {
                self.pending.lock().remove(&id);
                debug!(kind, request_id = id, peer_id = %peer.id, error = %RetrieveError::Timeout, "attempt failed");
                self.pool.update_score(&peer.id, ConnectionOutcome::Timeout);
                return AttemptResult::Failed;
            }
            _ = quit.changed() => {
                self.pending.lock().remove(&id);
                return AttemptResult::Canceled;
            }
        };

        match event {
            Some(AttemptEvent::Response(response)) => match request.validate(response) {
                Ok(value) => {
                    self.pool.update_score(
                        &peer.id,
                        ConnectionOutcome::Success {
                            latency: started.elapsed(),
                        },
                    );
                    trace!(kind, request_id = id, peer_id = %peer.id, "response accepted");
                    AttemptResult::Done(value)
                }
                Err(err) => {
                    let err = RetrieveError::ValidationFailed(err.to_string());
                    warn!(kind, request_id = id, peer_id = %peer.id, error = %err, "invalid response");
                    self.pool
                        .update_score(&peer.id, ConnectionOutcome::InvalidResponse);
                    AttemptResult::Failed
                }
            },
            Some(AttemptEvent::PeerDropped) | None => {
                debug!(kind, request_id = id, peer_id = %peer.id, "peer dropped during attempt");
                AttemptResult::Failed
            }
        }
    }

    /// Hand an answer from `peer` to the attempt waiting on `request_id`.
    ///
    /// Returns `false` for unknown ids and for answers from a peer other than
    /// the one the request went to.
    pub fn deliver(&self, peer: PeerId, request_id: u64, response: ProtocolResponse) -> bool {
        let pending = {
            let mut pending = self.pending.lock();
            match pending.get(&request_id) {
                Some(attempt) if attempt.peer == peer => pending.remove(&request_id),
                Some(_) => {
                    debug!(request_id, peer_id = %peer, "response from unexpected peer dropped");
                    None
                }
                None => {
                    trace!(request_id, peer_id = %peer, "unsolicited response dropped");
                    None
                }
            }
        };
        match pending {
            Some(attempt) => attempt.tx.send(AttemptEvent::Response(response)).is_ok(),
            None => false,
        }
    }

    /// Pending attempts currently assigned to `peer`.
    pub fn pending_for(&self, peer: &PeerId) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|attempt| attempt.peer == *peer)
            .count()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl PeerSetObserver for RetrieveManager {
    fn peer_unregistered(&self, peer: &Arc<Peer>) {
        let dropped: Vec<PendingAttempt> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, attempt)| attempt.peer == peer.id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        if !dropped.is_empty() {
            debug!(peer_id = %peer.id, attempts = dropped.len(), "requeueing attempts of removed peer");
        }
        for attempt in dropped {
            let _ = attempt.tx.send(AttemptEvent::PeerDropped);
        }
    }
}
