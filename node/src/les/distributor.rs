//! Capacity-aware assignment of requests to peers.
//!
//! A single actor task owns the wait queue. Callers enqueue a predicate plus
//! a deadline and receive a [`PeerSlot`] once an eligible peer has spare
//! capacity. Dropping the slot gives the capacity back and wakes the actor.

use super::peers::{Peer, PeerSet, PeerSetObserver};
use super::retrieve::RetrieveError;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

pub type CanSend = Box<dyn Fn(&Peer) -> bool + Send + Sync>;

enum Command {
    Queue(QueuedRequest),
    Wake,
}

struct QueuedRequest {
    id: u64,
    can_send: CanSend,
    deadline: Instant,
    reply: oneshot::Sender<Result<PeerSlot, RetrieveError>>,
}

/// Capacity reserved on one peer for one request.
pub struct PeerSlot {
    peer: Arc<Peer>,
    wake: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSlot").field("peer", &self.peer.id).finish()
    }
}

impl PeerSlot {
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        self.peer.release();
        let _ = self.wake.send(Command::Wake);
    }
}

pub struct RequestDistributor {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RequestDistributor {
    /// Start the actor and subscribe it to peer set changes.
    pub fn spawn(peers: Arc<PeerSet>, quit: watch::Receiver<bool>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DistributorActor {
            peers: Arc::clone(&peers),
            rx,
            wake: tx.clone(),
            queue: VecDeque::new(),
            quit,
        };
        let handle = tokio::spawn(actor.run());
        let distributor = Arc::new(Self {
            tx,
            next_id: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        });
        let observer: Arc<dyn PeerSetObserver> = distributor.clone();
        peers.subscribe(Arc::downgrade(&observer));
        distributor
    }

    /// Wait for a peer accepted by `can_send` with spare capacity.
    ///
    /// Fails with `NoPeersAvailable` once `deadline` passes, immediately if it
    /// already has, and with `Canceled` after shutdown.
    pub async fn distribute(
        &self,
        can_send: CanSend,
        deadline: Instant,
    ) -> Result<PeerSlot, RetrieveError> {
        if deadline <= Instant::now() {
            return Err(RetrieveError::NoPeersAvailable);
        }
        let (reply, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Command::Queue(QueuedRequest {
                id,
                can_send,
                deadline,
                reply,
            }))
            .map_err(|_| RetrieveError::Canceled)?;
        rx.await.unwrap_or(Err(RetrieveError::Canceled))
    }

    /// Wait for the actor to exit after shutdown.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl PeerSetObserver for RequestDistributor {
    fn peer_registered(&self, _peer: &Arc<Peer>) {
        let _ = self.tx.send(Command::Wake);
    }

    fn peer_unregistered(&self, _peer: &Arc<Peer>) {
        let _ = self.tx.send(Command::Wake);
    }
}

struct DistributorActor {
    peers: Arc<PeerSet>,
    rx: mpsc::UnboundedReceiver<Command>,
    wake: mpsc::UnboundedSender<Command>,
    queue: VecDeque<QueuedRequest>,
    quit: watch::Receiver<bool>,
}

impl DistributorActor {
    async fn run(mut self) {
        loop {
            if *self.quit.borrow() {
                break;
            }
            self.dispatch();
            let next_deadline = self.queue.iter().map(|request| request.deadline).min();
            tokio::select! {
                changed = self.quit.changed() => {
                    if changed.is_err() || *self.quit.borrow() {
                        break;
                    }
                }
                command = self.rx.recv() => match command {
                    Some(Command::Queue(request)) => self.queue.push_back(request),
                    Some(Command::Wake) => {}
                    None => break,
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {}
            }
        }

        let queued = self.queue.len();
        for request in self.queue.drain(..) {
            let _ = request.reply.send(Err(RetrieveError::Canceled));
        }
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Queue(request) = command {
                let _ = request.reply.send(Err(RetrieveError::Canceled));
            }
        }
        debug!(queued, "request distributor stopped");
    }

    /// Assign every queued request that can be served right now, oldest first.
    fn dispatch(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let now = Instant::now();
        let peers = self.peers.snapshot();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        while let Some(request) = self.queue.pop_front() {
            if request.reply.is_closed() {
                continue;
            }
            if request.deadline <= now {
                trace!(request = request.id, "distribution deadline passed");
                let _ = request.reply.send(Err(RetrieveError::NoPeersAvailable));
                continue;
            }
            let chosen = peers
                .iter()
                .filter(|peer| peer.has_spare_capacity() && (request.can_send)(peer))
                .min_by_key(|peer| (peer.in_flight(), Reverse(peer.capacity())));
            match chosen {
                Some(peer) => {
                    peer.acquire();
                    trace!(request = request.id, peer_id = %peer.id, in_flight = peer.in_flight(), "request dispatched");
                    let slot = PeerSlot {
                        peer: Arc::clone(peer),
                        wake: self.wake.clone(),
                    };
                    // A caller that went away drops the slot, which frees the capacity.
                    let _ = request.reply.send(Ok(slot));
                }
                None => waiting.push_back(request),
            }
        }
        self.queue = waiting;
    }
}
