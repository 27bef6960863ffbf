//! Connected light servers.

use super::{NodeRecord, PeerId};
use crate::chain::ChainHead;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerSetError {
    #[error("peer {0} already registered")]
    AlreadyRegistered(PeerId),
    #[error("peer {0} not registered")]
    NotFound(PeerId),
}

/// A handshaked server. Only the distributor bumps `in_flight`.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub record: NodeRecord,
    pub version: u32,
    capacity: usize,
    head: RwLock<ChainHead>,
    in_flight: AtomicUsize,
}

impl Peer {
    pub fn new(record: NodeRecord, version: u32, capacity: usize, head: ChainHead) -> Self {
        Self {
            id: record.id,
            record,
            version,
            capacity: capacity.max(1),
            head: RwLock::new(head),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn head(&self) -> ChainHead {
        *self.head.read()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.in_flight() < self.capacity
    }

    pub(crate) fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Notified after the peer map changed, outside the lock.
pub trait PeerSetObserver: Send + Sync {
    fn peer_registered(&self, _peer: &Arc<Peer>) {}
    fn peer_unregistered(&self, peer: &Arc<Peer>);
}

#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    observers: RwLock<Vec<Weak<dyn PeerSetObserver>>>,
}

impl std::fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSet").field("len", &self.len()).finish()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Weak<dyn PeerSetObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn PeerSetObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn register(&self, peer: Peer) -> Result<Arc<Peer>, PeerSetError> {
        let peer = Arc::new(peer);
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&peer.id) {
                return Err(PeerSetError::AlreadyRegistered(peer.id));
            }
            peers.insert(peer.id, Arc::clone(&peer));
        }
        debug!(peer_id = %peer.id, version = peer.version, capacity = peer.capacity, "peer registered");
        for observer in self.observers() {
            observer.peer_registered(&peer);
        }
        Ok(peer)
    }

    pub fn unregister(&self, id: &PeerId) -> Result<Arc<Peer>, PeerSetError> {
        let peer = self
            .peers
            .write()
            .remove(id)
            .ok_or(PeerSetError::NotFound(*id))?;
        debug!(peer_id = %id, "peer unregistered");
        for observer in self.observers() {
            observer.peer_unregistered(&peer);
        }
        Ok(peer)
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer with the highest total difficulty.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .max_by_key(|peer| peer.head().td)
            .cloned()
    }

    /// Point-in-time copy; later registrations do not affect it.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn update_head(&self, id: &PeerId, head: ChainHead) -> Result<(), PeerSetError> {
        let peer = self.peer(id).ok_or(PeerSetError::NotFound(*id))?;
        *peer.head.write() = head;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_peer;
    use alloy_primitives::U256;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        removed: Mutex<Vec<PeerId>>,
    }

    impl PeerSetObserver for Recorder {
        fn peer_unregistered(&self, peer: &Arc<Peer>) {
            self.removed.lock().push(peer.id);
        }
    }

    #[test]
    fn register_twice_fails() {
        let set = PeerSet::new();
        set.register(test_peer(1, 1, 10)).expect("register");
        assert!(matches!(
            set.register(test_peer(1, 1, 10)),
            Err(PeerSetError::AlreadyRegistered(_))
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn unregister_unknown_fails_and_notifies_on_success() {
        let set = PeerSet::new();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn PeerSetObserver> = recorder.clone();
        set.subscribe(Arc::downgrade(&observer));

        let peer = set.register(test_peer(1, 1, 10)).expect("register");
        assert!(matches!(
            set.unregister(&test_peer(2, 1, 10).id),
            Err(PeerSetError::NotFound(_))
        ));
        set.unregister(&peer.id).expect("unregister");
        assert_eq!(*recorder.removed.lock(), vec![peer.id]);
        assert!(set.is_empty());
    }

    #[test]
    fn best_peer_tracks_total_difficulty() {
        let set = PeerSet::new();
        assert!(set.best_peer().is_none());
        let low = set.register(test_peer(1, 1, 10)).expect("register");
        let high = set.register(test_peer(2, 1, 20)).expect("register");
        assert_eq!(set.best_peer().map(|p| p.id), Some(high.id));

        let mut head = low.head();
        head.td = U256::from(1_000);
        set.update_head(&low.id, head).expect("update");
        assert_eq!(set.best_peer().map(|p| p.id), Some(low.id));
    }

    #[test]
    fn snapshot_is_detached() {
        let set = PeerSet::new();
        set.register(test_peer(1, 1, 10)).expect("register");
        let snapshot = set.snapshot();
        set.register(test_peer(2, 1, 10)).expect("register");
        set.unregister(&snapshot[0].id).expect("unregister");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn release_never_underflows() {
        let peer = test_peer(1, 2, 10);
        peer.release();
        assert_eq!(peer.in_flight(), 0);
        peer.acquire();
        peer.acquire();
        assert!(!peer.has_spare_capacity());
        peer.release();
        assert!(peer.has_spare_capacity());
    }
}
