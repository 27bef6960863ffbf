//! Header and receipt types plus the canonical light chain.

use crate::proof::merkle_root;
use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const CHAIN_EVENT_BUFFER: usize = 256;

/// Block header fields the light client needs to verify remote data.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: B256,
    pub number: u64,
    pub difficulty: U256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub timestamp: u64,
    pub extra_data: Bytes,
}

impl Header {
    /// Keccak of the RLP encoding. Not cached.
    pub fn hash_slow(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable, Serialize, Deserialize)]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

/// Root committed to by `Header::receipts_root`.
pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    let leaves: Vec<B256> = receipts.iter().map(Receipt::hash).collect();
    merkle_root(&leaves)
}

/// Head announcement: what a peer or the local chain considers its tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub number: u64,
    pub hash: B256,
    pub td: U256,
}

/// Events forwarded to subscribers of the light chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Head(ChainHead),
    Reorg {
        ancestor_number: u64,
        removed_numbers: Vec<u64>,
        new_head: ChainHead,
    },
}

/// Chain update result after inserting a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainUpdate {
    Initialized { head: ChainHead },
    Extended { new_head: ChainHead },
    Reorg {
        ancestor_number: u64,
        removed_numbers: Vec<u64>,
        new_head: ChainHead,
    },
    /// Stored off the canonical chain; the head is unchanged.
    SideChain { tip: ChainHead },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("unknown parent {0}")]
    UnknownParent(B256),
    #[error("non-contiguous header number: expected {expected}, got {got}")]
    NonContiguousNumber { expected: u64, got: u64 },
}

/// Read access to the canonical chain.
pub trait ChainReader: Send + Sync {
    fn head(&self) -> Option<ChainHead>;
    fn canonical_header(&self, number: u64) -> Option<Header>;
    fn header_by_hash(&self, hash: &B256) -> Option<Header>;
    fn total_difficulty(&self, hash: &B256) -> Option<U256>;
    /// Watch channel updated on every head change.
    fn subscribe_head(&self) -> watch::Receiver<Option<ChainHead>>;
}

#[derive(Debug, Default)]
struct ChainState {
    headers: HashMap<B256, (Header, U256)>,
    canonical: BTreeMap<u64, B256>,
    canonical_by_hash: HashMap<B256, u64>,
    head: Option<ChainHead>,
}

impl ChainState {
    fn insert_canonical(&mut self, number: u64, hash: B256) {
        self.canonical.insert(number, hash);
        self.canonical_by_hash.insert(hash, number);
    }
}

/// In-memory canonical header chain with reorg detection.
#[derive(Debug)]
pub struct LightChain {
    state: RwLock<ChainState>,
    head_tx: watch::Sender<Option<ChainHead>>,
    events_tx: broadcast::Sender<ChainEvent>,
}

impl Default for LightChain {
    fn default() -> Self {
        Self::new()
    }
}

impl LightChain {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(CHAIN_EVENT_BUFFER);
        Self {
            state: RwLock::new(ChainState::default()),
            head_tx,
            events_tx,
        }
    }

    pub fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.state.read().canonical.get(&number).copied()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.events_tx.subscribe()
    }

    /// Insert a header. The first header inserted becomes the chain root.
    pub fn insert_header(&self, header: Header) -> Result<ChainUpdate, ChainError> {
        let update = {
            let mut state = self.state.write();
            Self::apply(&mut state, header)?
        };

        let (head, event) = match &update {
            ChainUpdate::SideChain { .. } => return Ok(update),
            ChainUpdate::Initialized { head } => (*head, ChainEvent::Head(*head)),
            ChainUpdate::Extended { new_head } => (*new_head, ChainEvent::Head(*new_head)),
            ChainUpdate::Reorg {
                ancestor_number,
                removed_numbers,
                new_head,
            } => {
                info!(
                    ancestor = ancestor_number,
                    removed = removed_numbers.len(),
                    new_head = new_head.number,
                    "chain reorganized"
                );
                (
                    *new_head,
                    ChainEvent::Reorg {
                        ancestor_number: *ancestor_number,
                        removed_numbers: removed_numbers.clone(),
                        new_head: *new_head,
                    },
                )
            }
        };
        self.head_tx.send_replace(Some(head));
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
        Ok(update)
    }

    fn apply(state: &mut ChainState, header: Header) -> Result<ChainUpdate, ChainError> {
        let hash = header.hash_slow();
        let number = header.number;

        let Some(current_head) = state.head else {
            let head = ChainHead {
                number,
                hash,
                td: header.difficulty,
            };
            state.headers.insert(hash, (header, head.td));
            state.insert_canonical(number, hash);
            state.head = Some(head);
            return Ok(ChainUpdate::Initialized { head });
        };

        let parent_hash = header.parent_hash;
        let (parent_number, parent_td) = state
            .headers
            .get(&parent_hash)
            .map(|(parent, td)| (parent.number, *td))
            .ok_or(ChainError::UnknownParent(parent_hash))?;
        let expected = parent_number + 1;
        if number != expected {
            return Err(ChainError::NonContiguousNumber {
                expected,
                got: number,
            });
        }
        let td = parent_td + header.difficulty;
        let new_head = ChainHead { number, hash, td };

        if parent_hash == current_head.hash {
            state.headers.insert(hash, (header, td));
            state.insert_canonical(number, hash);
            state.head = Some(new_head);
            return Ok(ChainUpdate::Extended { new_head });
        }

        if td <= current_head.td {
            debug!(number, %hash, %td, head_td = %current_head.td, "stored side chain header");
            state.headers.insert(hash, (header, td));
            return Ok(ChainUpdate::SideChain { tip: new_head });
        }

        // Heavier branch: walk back to the canonical ancestor.
        let mut branch = vec![(number, hash)];
        let mut cursor = parent_hash;
        let ancestor_number = loop {
            if let Some(ancestor) = state.canonical_by_hash.get(&cursor) {
                break *ancestor;
            }
            let (branch_number, branch_parent) = state
                .headers
                .get(&cursor)
                .map(|(header, _)| (header.number, header.parent_hash))
                .ok_or(ChainError::UnknownParent(cursor))?;
            branch.push((branch_number, cursor));
            cursor = branch_parent;
        };

        let removed_numbers: Vec<u64> = state
            .canonical
            .range((ancestor_number + 1)..)
            .map(|(number, _)| *number)
            .collect();
        for removed in &removed_numbers {
            if let Some(old) = state.canonical.remove(removed) {
                state.canonical_by_hash.remove(&old);
            }
        }
        state.headers.insert(hash, (header, td));
        for (number, hash) in branch.into_iter().rev() {
            state.insert_canonical(number, hash);
        }
        state.head = Some(new_head);

        Ok(ChainUpdate::Reorg {
            ancestor_number,
            removed_numbers,
            new_head,
        })
    }

    /// Drop header bodies below `number`. Canonical hashes are kept so later
    /// reorg detection still works; pruned headers are served by retrieval.
    pub fn prune_below(&self, number: u64) -> usize {
        let mut state = self.state.write();
        let hashes: Vec<B256> = state
            .canonical
            .range(..number)
            .map(|(_, hash)| *hash)
            .collect();
        let mut pruned = 0;
        for hash in hashes {
            if state.headers.remove(&hash).is_some() {
                pruned += 1;
            }
        }
        debug!(below = number, pruned, "pruned local headers");
        pruned
    }
}

impl ChainReader for LightChain {
    fn head(&self) -> Option<ChainHead> {
        self.state.read().head
    }

    fn canonical_header(&self, number: u64) -> Option<Header> {
        let state = self.state.read();
        let hash = state.canonical.get(&number)?;
        state.headers.get(hash).map(|(header, _)| header.clone())
    }

    fn header_by_hash(&self, hash: &B256) -> Option<Header> {
        self.state.read().headers.get(hash).map(|(header, _)| header.clone())
    }

    fn total_difficulty(&self, hash: &B256) -> Option<U256> {
        self.state.read().headers.get(hash).map(|(_, td)| *td)
    }

    fn subscribe_head(&self) -> watch::Receiver<Option<ChainHead>> {
        self.head_tx.subscribe()
    }
}
