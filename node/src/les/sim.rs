//! In-process light servers over a synthetic chain.
//!
//! Used by `simulate` and by tests to drive the full retrieval pipeline
//! without a wire protocol. Servers answer with real proofs computed from
//! the generated chain, optionally corrupted or withheld.

use super::request::{ProtocolRequest, ProtocolResponse};
use super::transport::{Dialer, Handshake, NetworkEvent, TopicDiscovery, Transport};
use super::peers::Peer;
use super::{NodeRecord, PeerId, LPV1, LPV2};
use crate::chain::{receipts_root, ChainError, ChainHead, Header, LightChain, Log, Receipt};
use crate::indexer::{cht_leaf, BloomBitsGenerator, SectionConfig};
use crate::proof::{merkle_proof, merkle_root};
use alloy_primitives::{Address, Bloom, BloomInput, Bytes, B256, B512, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Contracts emitting logs in generated blocks.
pub const SIM_CONTRACTS: usize = 8;

pub fn sim_contract(index: usize) -> Address {
    Address::repeat_byte(0x10 + index as u8)
}

#[derive(Debug)]
struct SimChainData {
    headers: Vec<Header>,
    hashes: Vec<B256>,
    tds: Vec<U256>,
    receipts: Vec<Vec<Receipt>>,
    by_hash: HashMap<B256, u64>,
    cht: SectionConfig,
    bloom: SectionConfig,
}

/// Deterministic chain with receipts and logs, able to answer every request kind.
#[derive(Debug, Clone)]
pub struct SimChain {
    data: Arc<SimChainData>,
}

impl SimChain {
    pub fn generate(len: u64, seed: u64, cht: SectionConfig, bloom: SectionConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut headers = Vec::with_capacity(len as usize);
        let mut hashes: Vec<B256> = Vec::with_capacity(len as usize);
        let mut tds: Vec<U256> = Vec::with_capacity(len as usize);
        let mut all_receipts = Vec::with_capacity(len as usize);

        for number in 0..len {
            let receipts = random_receipts(&mut rng);
            let mut logs_bloom = Bloom::ZERO;
            for receipt in &receipts {
                logs_bloom.accrue_bloom(&receipt.logs_bloom);
            }
            let header = Header {
                parent_hash: hashes.last().copied().unwrap_or(B256::ZERO),
                number,
                difficulty: U256::from(rng.gen_range(1u64..=4)),
                receipts_root: receipts_root(&receipts),
                logs_bloom,
                timestamp: number * 12,
                extra_data: Bytes::copy_from_slice(&seed.to_be_bytes()),
            };
            let hash = header.hash_slow();
            let td = tds.last().copied().unwrap_or(U256::ZERO) + header.difficulty;
            headers.push(header);
            hashes.push(hash);
            tds.push(td);
            all_receipts.push(receipts);
        }

        let by_hash = hashes
            .iter()
            .enumerate()
            .map(|(number, hash)| (*hash, number as u64))
            .collect();
        Self {
            data: Arc::new(SimChainData {
                headers,
                hashes,
                tds,
                receipts: all_receipts,
                by_hash,
                cht,
                bloom,
            }),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.headers.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.headers.is_empty()
    }

    pub fn header(&self, number: u64) -> &Header {
        &self.data.headers[number as usize]
    }

    pub fn receipts(&self, number: u64) -> Vec<Receipt> {
        self.data.receipts[number as usize].clone()
    }

    pub fn head(&self) -> ChainHead {
        let last = self.data.headers.len().saturating_sub(1);
        ChainHead {
            number: last as u64,
            hash: self.data.hashes.get(last).copied().unwrap_or(B256::ZERO),
            td: self.data.tds.get(last).copied().unwrap_or(U256::ZERO),
        }
    }

    /// Blocks that actually carry a log emitted by `address`.
    pub fn blocks_with_log(&self, address: Address) -> Vec<u64> {
        self.data
            .receipts
            .iter()
            .enumerate()
            .filter(|(_, receipts)| {
                receipts
                    .iter()
                    .any(|receipt| receipt.logs.iter().any(|log| log.address == address))
            })
            .map(|(number, _)| number as u64)
            .collect()
    }

    pub fn import_into(&self, chain: &LightChain) -> Result<(), ChainError> {
        for header in &self.data.headers {
            chain.insert_header(header.clone())?;
        }
        Ok(())
    }

    fn section_complete(&self, config: &SectionConfig, section: u64) -> bool {
        config.section_end(section) < self.len()
    }

    fn cht_leaves(&self, section: u64) -> Vec<B256> {
        let size = self.data.cht.size;
        (section * size..(section + 1) * size)
            .map(|number| {
                let i = number as usize;
                cht_leaf(number, self.data.hashes[i], self.data.tds[i])
            })
            .collect()
    }

    fn bloom_bits(&self, section: u64) -> BloomBitsGenerator {
        let size = self.data.bloom.size;
        let mut generator = BloomBitsGenerator::new(size);
        for number in section * size..(section + 1) * size {
            generator.add_bloom(&self.data.headers[number as usize].logs_bloom);
        }
        generator
    }

    pub fn cht_root(&self, section: u64) -> B256 {
        merkle_root(&self.cht_leaves(section))
    }

    pub fn bloom_trie_root(&self, section: u64) -> B256 {
        merkle_root(&self.bloom_bits(section).trie_leaves())
    }

    /// Honest server answer, or `None` if the server lacks the data.
    pub fn serve(&self, request: &ProtocolRequest) -> Option<ProtocolResponse> {
        match *request {
            ProtocolRequest::HeaderProof { section, number } => {
                let cht = self.data.cht;
                if cht.section_of(number) != section || !self.section_complete(&cht, section) {
                    return None;
                }
                let proof =
                    merkle_proof(&self.cht_leaves(section), (number - section * cht.size) as usize)?;
                Some(ProtocolResponse::HeaderProof {
                    header: self.header(number).clone(),
                    td: self.data.tds[number as usize],
                    proof,
                })
            }
            ProtocolRequest::Receipts { hash } => {
                let number = *self.data.by_hash.get(&hash)?;
                Some(ProtocolResponse::Receipts(self.receipts(number)))
            }
            ProtocolRequest::BloomBits { section, bit } => {
                if !self.section_complete(&self.data.bloom, section) {
                    return None;
                }
                let bits = self.bloom_bits(section);
                let proof = merkle_proof(&bits.trie_leaves(), bit as usize)?;
                Some(ProtocolResponse::BloomBits {
                    vector: Bytes::copy_from_slice(bits.vector(bit)),
                    proof,
                })
            }
        }
    }
}

fn random_receipts(rng: &mut StdRng) -> Vec<Receipt> {
    let count = rng.gen_range(1..=3);
    let mut cumulative_gas_used = 0;
    let mut receipts = Vec::with_capacity(count);
    for _ in 0..count {
        cumulative_gas_used += rng.gen_range(21_000u64..200_000);
        let mut logs = Vec::new();
        for _ in 0..rng.gen_range(0..=2) {
            if rng.gen_bool(0.3) {
                logs.push(Log {
                    address: sim_contract(rng.gen_range(0..SIM_CONTRACTS)),
                    topics: vec![B256::from(rng.gen::<[u8; 32]>())],
                    data: Bytes::new(),
                });
            }
        }
        let mut logs_bloom = Bloom::ZERO;
        for log in &logs {
            logs_bloom.accrue(BloomInput::Raw(log.address.as_slice()));
            for topic in &log.topics {
                logs_bloom.accrue(BloomInput::Raw(topic.as_slice()));
            }
        }
        receipts.push(Receipt {
            success: rng.gen_bool(0.95),
            cumulative_gas_used,
            logs_bloom,
            logs,
        });
    }
    receipts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    Honest,
    /// Answers with data that fails verification.
    Corrupt,
    /// Accepts requests and never answers.
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimServer {
    pub record: NodeRecord,
    pub version: u32,
    pub capacity: usize,
    pub latency: Duration,
    pub fault: SimFault,
}

/// `count` servers, the first `faulty` of them misbehaving.
pub fn generate_servers(count: usize, faulty: usize, seed: u64) -> Vec<SimServer> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|index| {
            let mut id = [0u8; 64];
            rng.fill(&mut id[..]);
            let fault = match index {
                i if i < faulty && i % 2 == 0 => SimFault::Corrupt,
                i if i < faulty => SimFault::Silent,
                _ => SimFault::Honest,
            };
            SimServer {
                record: NodeRecord {
                    id: B512::from(id),
                    addr: SocketAddr::from((Ipv4Addr::new(10, 0, 0, index as u8 + 1), 30303)),
                },
                version: if index % 4 == 3 { LPV1 } else { LPV2 },
                capacity: rng.gen_range(1..=4),
                latency: Duration::from_millis(rng.gen_range(5..40)),
                fault,
            }
        })
        .collect()
}

/// Transport, dialer and discovery backed by [`SimServer`]s.
pub struct SimNetwork {
    chain: SimChain,
    servers: HashMap<PeerId, SimServer>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    jitter: Duration,
}

impl SimNetwork {
    pub fn new(
        chain: SimChain,
        servers: Vec<SimServer>,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            servers: servers
                .into_iter()
                .map(|server| (server.record.id, server))
                .collect(),
            events,
            jitter: Duration::from_millis(10),
        })
    }

    pub fn records(&self) -> Vec<NodeRecord> {
        self.servers.values().map(|server| server.record).collect()
    }

    fn delay(&self, server: &SimServer) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        server.latency + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Drop the connection to `id`, as a remote hang-up would.
    pub fn disconnect(&self, id: PeerId) {
        let _ = self.events.send(NetworkEvent::Disconnected(id));
    }
}

fn corrupt(response: &mut ProtocolResponse) {
    match response {
        ProtocolResponse::HeaderProof { td, .. } => *td += U256::from(1),
        ProtocolResponse::Receipts(receipts) => {
            receipts.pop();
        }
        ProtocolResponse::BloomBits { vector, .. } => {
            let mut flipped = vector.to_vec();
            if let Some(byte) = flipped.first_mut() {
                *byte ^= 0xff;
            }
            *vector = flipped.into();
        }
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn send(&self, peer: &Peer, request_id: u64, request: ProtocolRequest) -> Result<()> {
        let server = self
            .servers
            .get(&peer.id)
            .ok_or_else(|| eyre!("no route to {}", peer.id))?;
        if server.fault == SimFault::Silent {
            trace!(peer_id = %peer.id, request_id, "simulated server withholding answer");
            return Ok(());
        }
        let Some(mut response) = self.chain.serve(&request) else {
            return Err(eyre!("server cannot serve {}", request.name()));
        };
        if server.fault == SimFault::Corrupt {
            corrupt(&mut response);
        }
        let delay = self.delay(server);
        let events = self.events.clone();
        let peer_id = peer.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(NetworkEvent::Response {
                peer: peer_id,
                request_id,
                response,
            });
        });
        Ok(())
    }
}

#[async_trait]
impl Dialer for SimNetwork {
    async fn dial(&self, record: &NodeRecord) -> Result<()> {
        let server = self
            .servers
            .get(&record.id)
            .ok_or_else(|| eyre!("connection refused by {}", record.addr))?;
        tokio::time::sleep(server.latency).await;
        self.events
            .send(NetworkEvent::Connected(Handshake {
                record: server.record,
                version: server.version,
                capacity: server.capacity,
                head: self.chain.head(),
            }))
            .map_err(|_| eyre!("network event loop closed"))
    }
}

#[async_trait]
impl TopicDiscovery for SimNetwork {
    async fn lookup(&self, _topic: &str) -> Result<Vec<NodeRecord>> {
        Ok(self.records())
    }
}
