//! Bloom-bit retrieval service and section matcher.
//!
//! A fixed set of worker tasks drain a shared queue in small batches. Each
//! vector is read from the locally indexed bloom bits when present and
//! fetched through ODR otherwise. The matcher ANDs the three vectors of a
//! bloom entry to find candidate blocks; candidates are a superset of the
//! blocks that really carry the entry.

use super::odr::{LesOdr, OdrError};
use super::retrieve::RetrieveError;
use crate::indexer::{bloom_bits_key, SectionConfig, BLOOM_BIT_LENGTH};
use crate::storage::KeyValueStore;
use alloy_primitives::{keccak256, Bytes};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct BloomServiceConfig {
    pub threads: usize,
    /// Most retrievals one worker takes from the queue at once.
    pub batch: usize,
    /// How long a worker waits to fill a batch.
    pub wait: Duration,
}

impl Default for BloomServiceConfig {
    fn default() -> Self {
        Self {
            threads: 16,
            batch: 16,
            wait: Duration::from_millis(10),
        }
    }
}

/// Bloom bit indexes touched by `data`.
pub fn bloom_bit_indexes(data: &[u8]) -> [u16; 3] {
    let hash = keccak256(data);
    let mut indexes = [0u16; 3];
    for (i, index) in indexes.iter_mut().enumerate() {
        let raw = u16::from_be_bytes([hash[2 * i], hash[2 * i + 1]]);
        *index = raw & (BLOOM_BIT_LENGTH as u16 - 1);
    }
    indexes
}

#[derive(Debug, Default)]
pub struct BloomStats {
    pub local: AtomicU64,
    pub remote: AtomicU64,
}

struct BloomTask {
    bit: u16,
    sections: Vec<u64>,
    reply: oneshot::Sender<Result<Vec<Bytes>, OdrError>>,
}

pub struct BloomService {
    tx: mpsc::Sender<BloomTask>,
    section: SectionConfig,
    stats: Arc<BloomStats>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BloomService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomService")
            .field("section", &self.section)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Spawn `config.threads` workers serving bloom-bit retrievals until `quit`.
pub fn start_bloom_handlers(
    config: BloomServiceConfig,
    odr: Arc<LesOdr>,
    store: Arc<dyn KeyValueStore>,
    quit: watch::Receiver<bool>,
) -> BloomService {
    let threads = config.threads.max(1);
    let batch = config.batch.max(1);
    let (tx, rx) = mpsc::channel(threads * batch);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let stats = Arc::new(BloomStats::default());
    let handles = (0..threads)
        .map(|worker| {
            let worker = BloomWorker {
                id: worker,
                rx: Arc::clone(&rx),
                batch,
                wait: config.wait,
                odr: Arc::clone(&odr),
                store: Arc::clone(&store),
                stats: Arc::clone(&stats),
                quit: quit.clone(),
            };
            tokio::spawn(worker.run())
        })
        .collect();
    debug!(threads, batch, "bloom handlers started");
    BloomService {
        tx,
        section: odr.bloom_section(),
        stats,
        handles: Mutex::new(handles),
    }
}

fn canceled() -> OdrError {
    OdrError::Retrieve(RetrieveError::Canceled)
}

impl BloomService {
    pub fn section_config(&self) -> SectionConfig {
        self.section
    }

    /// Vectors served from the local index and from peers so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.local.load(Ordering::Relaxed),
            self.stats.remote.load(Ordering::Relaxed),
        )
    }

    /// Vectors of `bit` for each of `sections`, in order.
    pub async fn retrieve(&self, bit: u16, sections: Vec<u64>) -> Result<Vec<Bytes>, OdrError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BloomTask {
                bit,
                sections,
                reply,
            })
            .await
            .map_err(|_| canceled())?;
        rx.await.unwrap_or_else(|_| Err(canceled()))
    }

    /// Candidate block numbers in `section` whose bloom may contain `data`.
    pub async fn filter_section(&self, data: &[u8], section: u64) -> Result<Vec<u64>, OdrError> {
        let vectors = join_all(
            bloom_bit_indexes(data)
                .into_iter()
                .map(|bit| self.retrieve(bit, vec![section])),
        )
        .await;

        let mut matched: Option<Vec<u8>> = None;
        for vector in vectors {
            let vector = vector?.into_iter().next().ok_or_else(canceled)?;
            matched = Some(match matched {
                None => vector.to_vec(),
                Some(acc) => acc.iter().zip(vector.iter()).map(|(a, b)| a & b).collect(),
            });
        }

        let start = section * self.section.size;
        let candidates = (0..self.section.size)
            .filter(|j| {
                matched.as_ref().is_some_and(|bits| {
                    bits.get((j / 8) as usize)
                        .is_some_and(|byte| byte & (1u8 << (7 - j % 8)) != 0)
                })
            })
            .map(|j| start + j)
            .collect();
        Ok(candidates)
    }

    /// Wait for every worker to exit after shutdown.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

struct BloomWorker {
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BloomTask>>>,
    batch: usize,
    wait: Duration,
    odr: Arc<LesOdr>,
    store: Arc<dyn KeyValueStore>,
    stats: Arc<BloomStats>,
    quit: watch::Receiver<bool>,
}

impl BloomWorker {
    async fn run(self) {
        loop {
            if *self.quit.borrow() {
                break;
            }
            let mut quit = self.quit.clone();
            let batch = tokio::select! {
                batch = self.next_batch() => batch,
                _ = quit.changed() => break,
            };
            let Some(batch) = batch else {
                break;
            };
            trace!(worker = self.id, tasks = batch.len(), "serving bloom batch");
            join_all(batch.into_iter().map(|task| self.serve(task))).await;
        }
        trace!(worker = self.id, "bloom worker stopped");
    }

    async fn next_batch(&self) -> Option<Vec<BloomTask>> {
        let mut rx = self.rx.lock().await;
        let first = rx.recv().await?;
        let mut batch = vec![first];
        let deadline = Instant::now() + self.wait;
        while batch.len() < self.batch {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(task)) => batch.push(task),
                _ => break,
            }
        }
        Some(batch)
    }

    async fn serve(&self, task: BloomTask) {
        let vectors = join_all(
            task.sections
                .iter()
                .map(|section| self.vector(task.bit, *section)),
        )
        .await;
        let _ = task.reply.send(vectors.into_iter().collect());
    }

    async fn vector(&self, bit: u16, section: u64) -> Result<Bytes, OdrError> {
        match self.store.get(&bloom_bits_key(bit, section)) {
            Ok(Some(vector)) => {
                self.stats.local.fetch_add(1, Ordering::Relaxed);
                return Ok(vector.into());
            }
            Ok(None) => {}
            Err(err) => {
                warn!(bit, section, error = %err, "local bloom bits unreadable");
            }
        }
        let fetched = self.odr.bloom_bits(bit, section).await?;
        self.stats.remote.fetch_add(1, Ordering::Relaxed);
        Ok(fetched.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{BloomIndexer, ChainIndexer};
    use crate::les::sim::{generate_servers, sim_contract, SIM_CONTRACTS};
    use crate::storage::MemoryStore;
    use crate::test_utils::{sim_odr, sim_stack, BLOOM_TEST};
    use alloy_primitives::{Bloom, BloomInput};

    fn fast() -> BloomServiceConfig {
        BloomServiceConfig {
            threads: 2,
            batch: 4,
            wait: Duration::from_millis(2),
        }
    }

    #[test]
    fn bit_indexes_match_header_bloom() {
        let address = sim_contract(3);
        let mut bloom = Bloom::ZERO;
        bloom.accrue(BloomInput::Raw(address.as_slice()));
        for bit in bloom_bit_indexes(address.as_slice()) {
            let bit = usize::from(bit);
            assert_ne!(bloom[255 - bit / 8] & (1 << (bit % 8)), 0, "bit {bit}");
        }
    }

    #[tokio::test]
    async fn remote_filter_finds_every_log() {
        let stack = sim_stack(40, generate_servers(3, 0, 8));
        let odr = Arc::new(sim_odr(&stack));
        let service = start_bloom_handlers(
            fast(),
            odr,
            Arc::new(MemoryStore::new()),
            stack.quit.clone(),
        );

        for index in 0..SIM_CONTRACTS {
            let address = sim_contract(index);
            let expected = stack.data.blocks_with_log(address);
            for section in 0..2 {
                let candidates = service
                    .filter_section(address.as_slice(), section)
                    .await
                    .expect("filter");
                let range = section * BLOOM_TEST.size..(section + 1) * BLOOM_TEST.size;
                assert!(candidates.iter().all(|n| range.contains(n)));
                for number in expected.iter().filter(|n| range.contains(n)) {
                    assert!(candidates.contains(number), "block {number} missed");
                }
            }
        }
        let (local, remote) = service.stats();
        assert_eq!(local, 0);
        assert!(remote > 0);
    }

    #[tokio::test]
    async fn local_vectors_skip_the_network() {
        let stack = sim_stack(40, generate_servers(2, 0, 9));
        let bloom = ChainIndexer::new(
            BLOOM_TEST,
            BloomIndexer::new(BLOOM_TEST.size),
            stack.chain.clone(),
            stack.store.clone(),
        )
        .expect("bloom indexer");
        assert_eq!(bloom.confirm_ready().expect("confirm"), 2);

        let odr = Arc::new(sim_odr(&stack));
        let service = start_bloom_handlers(
            fast(),
            Arc::clone(&odr),
            stack.store.clone(),
            stack.quit.clone(),
        );
        let local = service.retrieve(77, vec![0, 1]).await.expect("local");
        let remote = odr.bloom_bits(77, 1).await.expect("remote").value;
        assert_eq!(local[1], remote);
        assert_eq!(service.stats(), (2, 0));
    }

    #[tokio::test]
    async fn quit_stops_workers() {
        let stack = sim_stack(40, generate_servers(1, 0, 10));
        let odr = Arc::new(sim_odr(&stack));
        let service = start_bloom_handlers(
            fast(),
            odr,
            Arc::new(MemoryStore::new()),
            stack.quit.clone(),
        );
        stack.quit_tx.send(true).expect("quit");
        service.join().await;
        assert_eq!(service.retrieve(1, vec![0]).await, Err(canceled()));
    }
}
