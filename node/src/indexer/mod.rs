//! Section indexers that summarize confirmed chain history.
//!
//! A [`ChainIndexer`] walks fixed-size block sections in order once they are
//! buried under enough confirmations, feeds every canonical header of a
//! section to its [`IndexerBackend`], and stores the resulting root. Stored
//! sections are never rewritten; a lagging indexer only delays roots.

mod bloom;
mod cht;

pub use bloom::{
    bloom_bits_key, bloom_trie_leaf, BloomBitsGenerator, BloomIndexer, BloomTrieIndexer,
    BLOOM_BIT_LENGTH,
};
pub use cht::{cht_leaf, ChtIndexer};

use crate::chain::{ChainReader, Header};
use crate::storage::{decode_json, encode_json, KeyValueStore};
use alloy_primitives::{B256, U256};
use eyre::{eyre, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Section geometry shared by an indexer and the requests validated against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionConfig {
    pub size: u64,
    pub confirmations: u64,
}

impl SectionConfig {
    pub fn section_of(&self, number: u64) -> u64 {
        number / self.size
    }

    /// Last block number belonging to `section`.
    pub fn section_end(&self, section: u64) -> u64 {
        section
            .saturating_add(1)
            .saturating_mul(self.size)
            .saturating_sub(1)
    }

    /// Head number required before `section` may be processed.
    pub fn required_head(&self, section: u64) -> u64 {
        self.section_end(section).saturating_add(self.confirmations)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexerError {
    #[error("section {section} not ready (head {head:?}, needs {required})")]
    SectionNotReady {
        section: u64,
        head: Option<u64>,
        required: u64,
    },
    #[error("canonical header {0} unavailable")]
    MissingHeader(u64),
}

/// Per-section summary computation.
pub trait IndexerBackend: Send + 'static {
    /// Key namespace in the store.
    const NAME: &'static str;

    fn reset(&mut self, section: u64);
    fn process(&mut self, header: &Header, hash: B256, td: U256);
    fn commit(&mut self) -> B256;

    /// Per-section records stored next to the root.
    fn artifacts(&self, _section: u64) -> Vec<(String, Vec<u8>)> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionCommit {
    pub root: B256,
    /// Hash of the last block in the section.
    pub head: B256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSections {
    pub count: u64,
    pub last_head: B256,
}

fn sections_key(name: &str) -> String {
    format!("{name}/sections")
}

/// Checkpoint of the indexer named `name`, read without a chain.
pub fn stored_sections(store: &dyn KeyValueStore, name: &str) -> Result<StoredSections> {
    match store.get(&sections_key(name))? {
        Some(bytes) => decode_json(&bytes),
        None => Ok(StoredSections::default()),
    }
}

pub struct ChainIndexer<B> {
    section: SectionConfig,
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn KeyValueStore>,
    backend: Mutex<B>,
    stored: RwLock<StoredSections>,
}

impl<B: IndexerBackend> ChainIndexer<B> {
    pub fn new(
        section: SectionConfig,
        backend: B,
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        if section.size == 0 {
            return Err(eyre!("{} section size must be positive", B::NAME));
        }
        let stored = stored_sections(store.as_ref(), B::NAME)?;
        debug!(indexer = B::NAME, sections = stored.count, "indexer checkpoint loaded");
        Ok(Self {
            section,
            chain,
            store,
            backend: Mutex::new(backend),
            stored: RwLock::new(stored),
        })
    }

    fn root_key(section: u64) -> String {
        format!("{}/root/{section}", B::NAME)
    }

    pub fn name(&self) -> &'static str {
        B::NAME
    }

    pub fn section_config(&self) -> SectionConfig {
        self.section
    }

    /// Confirmed section count and the head hash of the last one.
    pub fn sections(&self) -> StoredSections {
        *self.stored.read()
    }

    pub fn section_commit(&self, section: u64) -> Result<Option<SectionCommit>> {
        if section >= self.stored.read().count {
            return Ok(None);
        }
        match self.store.get(&Self::root_key(section))? {
            Some(bytes) => Ok(Some(decode_json(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn section_root(&self, section: u64) -> Option<B256> {
        match self.section_commit(section) {
            Ok(commit) => commit.map(|commit| commit.root),
            Err(err) => {
                warn!(indexer = B::NAME, section, error = %err, "failed to read section root");
                None
            }
        }
    }

    /// Root of `section`: the stored commit once confirmed, otherwise
    /// recomputed from the canonical chain.
    ///
    /// Never writes: calling it repeatedly on an unchanged chain returns the
    /// same commit. Confirmed sections stay answerable after their headers
    /// were pruned.
    pub fn process_section(&self, section: u64) -> Result<SectionCommit, IndexerError> {
        match self.section_commit(section) {
            Ok(Some(commit)) => return Ok(commit),
            Ok(None) => {}
            Err(err) => {
                warn!(indexer = B::NAME, section, error = %err, "stored section unreadable, recomputing");
            }
        }
        let mut backend = self.backend.lock();
        self.compute(&mut backend, section)
    }

    fn compute(&self, backend: &mut B, section: u64) -> Result<SectionCommit, IndexerError> {
        let required = self.section.required_head(section);
        let head = self.chain.head().map(|head| head.number);
        if head.is_none_or(|head| head < required) {
            return Err(IndexerError::SectionNotReady {
                section,
                head,
                required,
            });
        }

        backend.reset(section);
        let start = section * self.section.size;
        let mut last = B256::ZERO;
        for number in start..=self.section.section_end(section) {
            let header = self
                .chain
                .canonical_header(number)
                .ok_or(IndexerError::MissingHeader(number))?;
            let hash = header.hash_slow();
            let td = self
                .chain
                .total_difficulty(&hash)
                .ok_or(IndexerError::MissingHeader(number))?;
            backend.process(&header, hash, td);
            last = hash;
        }
        Ok(SectionCommit {
            root: backend.commit(),
            head: last,
        })
    }

    /// Store every section that became ready since the last call.
    pub fn confirm_ready(&self) -> Result<u64> {
        let mut confirmed = 0;
        let mut backend = self.backend.lock();
        loop {
            let next = self.stored.read().count;
            let commit = match self.compute(&mut backend, next) {
                Ok(commit) => commit,
                Err(IndexerError::SectionNotReady { .. }) => break,
                Err(err @ IndexerError::MissingHeader(_)) => {
                    return Err(eyre!("{} section {next}: {err}", B::NAME));
                }
            };
            let stored = StoredSections {
                count: next + 1,
                last_head: commit.head,
            };
            let mut batch = backend.artifacts(next);
            batch.push((Self::root_key(next), encode_json(&commit)?));
            batch.push((sections_key(B::NAME), encode_json(&stored)?));
            self.store.put_batch(batch)?;
            *self.stored.write() = stored;
            confirmed += 1;
            info!(
                indexer = B::NAME,
                section = next,
                root = %commit.root,
                "section confirmed"
            );
        }
        Ok(confirmed)
    }

    /// Follow the chain head in the background until `quit` flips.
    pub fn spawn(self: Arc<Self>, mut quit: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut head_rx = self.chain.subscribe_head();
        tokio::spawn(async move {
            loop {
                if *quit.borrow() {
                    break;
                }
                if let Err(err) = self.confirm_ready() {
                    warn!(indexer = B::NAME, error = %err, "section indexing stalled");
                }
                tokio::select! {
                    changed = head_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = quit.changed() => break,
                }
            }
            debug!(indexer = B::NAME, "indexer stopped");
        })
    }
}
