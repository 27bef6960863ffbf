//! On-demand retrieval facade.
//!
//! Answers from the local chain when it can, otherwise looks up the locally
//! confirmed section root that authenticates the answer and hands a verified
//! request to the [`RetrieveManager`].

use super::request::{BloomBitsRequest, HeaderRequest, HeaderWithTd, ReceiptsRequest};
use super::retrieve::{RetrieveError, RetrieveManager};
use super::PeerId;
use crate::chain::{ChainReader, Receipt};
use crate::indexer::{
    BloomTrieIndexer, ChainIndexer, ChtIndexer, SectionConfig, BLOOM_BIT_LENGTH,
};
use alloy_primitives::{Bytes, B256};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

pub const DEFAULT_HEADER_CACHE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OdrError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),
    #[error("{indexer} section {section} has no confirmed root")]
    SectionNotReady {
        indexer: &'static str,
        section: u64,
    },
    #[error("bloom bit {0} out of range")]
    BitOutOfRange(u16),
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Cache,
    Peer(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub value: T,
    pub source: Source,
}

pub struct LesOdr {
    chain: Arc<dyn ChainReader>,
    cht: Arc<ChainIndexer<ChtIndexer>>,
    bloom_trie: Arc<ChainIndexer<BloomTrieIndexer>>,
    retriever: Arc<RetrieveManager>,
    headers: Mutex<LruCache<u64, HeaderWithTd>>,
}

impl std::fmt::Debug for LesOdr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LesOdr")
            .field("cached_headers", &self.headers.lock().len())
            .finish()
    }
}

impl LesOdr {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        cht: Arc<ChainIndexer<ChtIndexer>>,
        bloom_trie: Arc<ChainIndexer<BloomTrieIndexer>>,
        retriever: Arc<RetrieveManager>,
        header_cache: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(header_cache).unwrap_or(NonZeroUsize::MIN);
        Self {
            chain,
            cht,
            bloom_trie,
            retriever,
            headers: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn retriever(&self) -> &Arc<RetrieveManager> {
        &self.retriever
    }

    pub fn bloom_section(&self) -> SectionConfig {
        self.bloom_trie.section_config()
    }

    /// Canonical header `number` with its total difficulty.
    pub async fn header_by_number(&self, number: u64) -> Result<Fetched<HeaderWithTd>, OdrError> {
        if let Some(local) = self.local_header(number) {
            return Ok(Fetched {
                value: local,
                source: Source::Local,
            });
        }
        let cached = self.headers.lock().get(&number).cloned();
        if let Some(cached) = cached {
            trace!(number, "header cache hit");
            return Ok(Fetched {
                value: cached,
                source: Source::Cache,
            });
        }

        let cht = self.cht.section_config();
        let section = cht.section_of(number);
        let cht_root = self
            .cht
            .section_root(section)
            .ok_or(OdrError::SectionNotReady {
                indexer: self.cht.name(),
                section,
            })?;
        let retrieved = self
            .retriever
            .retrieve(HeaderRequest {
                number,
                cht,
                cht_root,
            })
            .await?;
        debug!(number, peer_id = %retrieved.peer, "header retrieved");
        self.headers.lock().put(number, retrieved.value.clone());
        Ok(Fetched {
            value: retrieved.value,
            source: Source::Peer(retrieved.peer),
        })
    }

    fn local_header(&self, number: u64) -> Option<HeaderWithTd> {
        let header = self.chain.canonical_header(number)?;
        let td = self.chain.total_difficulty(&header.hash_slow())?;
        Some(HeaderWithTd { header, td })
    }

    /// Receipts of canonical block `number`, checked against its header.
    pub async fn block_receipts(&self, number: u64) -> Result<Fetched<Vec<Receipt>>, OdrError> {
        let header = self.header_by_number(number).await?.value.header;
        if header.receipts_root == B256::ZERO {
            return Ok(Fetched {
                value: Vec::new(),
                source: Source::Local,
            });
        }
        let retrieved = self
            .retriever
            .retrieve(ReceiptsRequest {
                number,
                hash: header.hash_slow(),
                receipts_root: header.receipts_root,
            })
            .await?;
        Ok(Fetched {
            value: retrieved.value,
            source: Source::Peer(retrieved.peer),
        })
    }

    /// Rotated vector of bloom bit `bit` over bloom section `section`.
    pub async fn bloom_bits(&self, bit: u16, section: u64) -> Result<Fetched<Bytes>, OdrError> {
        if usize::from(bit) >= BLOOM_BIT_LENGTH {
            return Err(OdrError::BitOutOfRange(bit));
        }
        let root = self
            .bloom_trie
            .section_root(section)
            .ok_or(OdrError::SectionNotReady {
                indexer: self.bloom_trie.name(),
                section,
            })?;
        let retrieved = self
            .retriever
            .retrieve(BloomBitsRequest {
                bit,
                section,
                bloom: self.bloom_trie.section_config(),
                root,
            })
            .await?;
        Ok(Fetched {
            value: retrieved.value,
            source: Source::Peer(retrieved.peer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::les::request::{ProtocolRequest, ProtocolResponse};
    use crate::les::sim::generate_servers;
    use crate::test_utils::{sim_odr, sim_stack};

    #[tokio::test]
    async fn local_headers_skip_the_network() {
        let stack = sim_stack(40, generate_servers(2, 0, 1));
        let odr = sim_odr(&stack);
        let fetched = odr.header_by_number(35).await.expect("header");
        assert_eq!(fetched.source, Source::Local);
        assert_eq!(fetched.value.header, stack.data.header(35).clone());
        assert_eq!(stack.meters.snapshot().out_packets, 0);
    }

    #[tokio::test]
    async fn pruned_header_is_proven_then_cached() {
        let stack = sim_stack(40, generate_servers(2, 0, 2));
        let odr = sim_odr(&stack);
        stack.chain.prune_below(32);

        let fetched = odr.header_by_number(10).await.expect("header");
        assert!(matches!(fetched.source, Source::Peer(_)));
        assert_eq!(fetched.value.header, stack.data.header(10).clone());

        let again = odr.header_by_number(10).await.expect("cached");
        assert_eq!(again.source, Source::Cache);
        assert_eq!(again.value, fetched.value);
    }

    #[tokio::test]
    async fn unconfirmed_section_is_not_ready() {
        let stack = sim_stack(40, generate_servers(2, 0, 3));
        let odr = sim_odr(&stack);
        stack.chain.prune_below(36);
        assert_eq!(
            odr.header_by_number(33).await,
            Err(OdrError::SectionNotReady {
                indexer: "cht",
                section: 4
            })
        );
        assert!(matches!(
            odr.bloom_bits(3, 2).await,
            Err(OdrError::SectionNotReady {
                indexer: "bloomtrie",
                section: 2
            })
        ));
        assert_eq!(
            odr.bloom_bits(4096, 0).await,
            Err(OdrError::BitOutOfRange(4096))
        );
    }

    #[tokio::test]
    async fn receipts_follow_the_fetched_header() {
        let stack = sim_stack(40, generate_servers(2, 0, 4));
        let odr = sim_odr(&stack);
        stack.chain.prune_below(32);

        let receipts = odr.block_receipts(12).await.expect("receipts");
        assert!(matches!(receipts.source, Source::Peer(_)));
        assert_eq!(receipts.value, stack.data.receipts(12));
    }

    #[tokio::test]
    async fn bloom_bits_are_verified_against_trie_root() {
        let stack = sim_stack(40, generate_servers(2, 0, 5));
        let odr = sim_odr(&stack);

        let fetched = odr.bloom_bits(77, 1).await.expect("vector");
        let Some(ProtocolResponse::BloomBits { vector, .. }) =
            stack.data.serve(&ProtocolRequest::BloomBits { section: 1, bit: 77 })
        else {
            panic!("sim chain serves complete sections");
        };
        assert_eq!(fetched.value, vector);
    }

    #[tokio::test]
    async fn corrupt_server_never_wins() {
        let servers = generate_servers(2, 1, 6);
        let honest = servers[1].record.id;
        let stack = sim_stack(40, servers);
        let odr = sim_odr(&stack);
        stack.chain.prune_below(32);

        for number in [3, 9, 17, 25] {
            let fetched = odr.header_by_number(number).await.expect("header");
            assert_eq!(fetched.source, Source::Peer(honest));
            assert_eq!(fetched.value.header, stack.data.header(number).clone());
        }
    }
}
