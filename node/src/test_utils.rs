use crate::chain::{ChainHead, ChainReader, Header, LightChain};
use crate::cli::{Command, NodeConfig, DEFAULT_LOG_JSON_FILTER};
use crate::indexer::{BloomTrieIndexer, ChainIndexer, ChtIndexer, SectionConfig};
use crate::les::distributor::RequestDistributor;
use crate::les::odr::LesOdr;
use crate::les::peers::{Peer, PeerSet};
use crate::les::retrieve::{RetrieveConfig, RetrieveManager};
use crate::les::server_pool::{PoolConfig, ServerPool};
use crate::les::sim::{SimChain, SimNetwork, SimServer};
use crate::les::transport::{MeteredTransport, NetworkEvent};
use crate::les::{NodeRecord, LPV2};
use crate::metrics::TrafficMeters;
use crate::storage::MemoryStore;
use alloy_primitives::{Bloom, Bytes, B256, B512, U256};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

pub const CHT_TEST: SectionConfig = SectionConfig {
    size: 8,
    confirmations: 2,
};

pub const BLOOM_TEST: SectionConfig = SectionConfig {
    size: 16,
    confirmations: 2,
};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "odr-light-client-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

/// Small sections and short timeouts so tests finish quickly.
pub fn base_config(data_dir: PathBuf) -> NodeConfig {
    NodeConfig {
        network_id: 1,
        genesis_hash: B256::repeat_byte(0x42),
        data_dir,
        verbosity: 0,
        log_json: None,
        log_json_filter: DEFAULT_LOG_JSON_FILTER.to_string(),
        protocol_version: LPV2,
        light_peers: 5,
        max_pool_entries: 64,
        request_timeout_ms: 500,
        retrieve_timeout_ms: 3_000,
        cht_section_size: CHT_TEST.size,
        cht_confirmations: CHT_TEST.confirmations,
        bloom_section_size: BLOOM_TEST.size,
        bloom_confirmations: BLOOM_TEST.confirmations,
        bloom_threads: 2,
        bloom_batch: 4,
        bloom_wait_ms: 2,
        header_cache: 64,
        bootnodes: Vec::new(),
        no_default_bootnodes: true,
        command: Some(Command::default()),
    }
}

pub fn sim_chain(len: u64, seed: u64) -> SimChain {
    SimChain::generate(len, seed, CHT_TEST, BLOOM_TEST)
}

/// Light chain holding the first `len` blocks of a synthetic chain.
pub fn test_chain(len: u64) -> (Arc<LightChain>, SimChain) {
    let data = sim_chain(len, 0);
    let chain = Arc::new(LightChain::new());
    data.import_into(&chain).expect("import");
    (chain, data)
}

/// Append `count` empty children of the current head.
pub fn extend_chain(chain: &LightChain, count: u64) {
    for _ in 0..count {
        let head = chain.head().expect("chain has a head");
        let parent = chain.header_by_hash(&head.hash).expect("head header");
        chain
            .insert_header(Header {
                parent_hash: head.hash,
                number: head.number + 1,
                difficulty: U256::from(1),
                receipts_root: B256::ZERO,
                logs_bloom: Bloom::ZERO,
                timestamp: parent.timestamp + 12,
                extra_data: Bytes::new(),
            })
            .expect("extend");
    }
}

pub fn node_record(seed: u8) -> NodeRecord {
    NodeRecord {
        id: B512::repeat_byte(seed),
        addr: SocketAddr::from((Ipv4Addr::new(127, 0, 0, seed), 30303)),
    }
}

pub fn test_peer(seed: u8, capacity: usize, head: u64) -> Peer {
    test_peer_with(seed, capacity, head, LPV2)
}

/// `head` doubles as the announced total difficulty.
pub fn test_peer_with(seed: u8, capacity: usize, head: u64, version: u32) -> Peer {
    Peer::new(
        node_record(seed),
        version,
        capacity,
        ChainHead {
            number: head,
            hash: B256::repeat_byte(seed),
            td: U256::from(head),
        },
    )
}

/// Retrieval pipeline over simulated servers that are already connected.
pub struct SimStack {
    pub data: SimChain,
    pub chain: Arc<LightChain>,
    pub store: Arc<MemoryStore>,
    pub peers: Arc<PeerSet>,
    pub retriever: Arc<RetrieveManager>,
    pub meters: Arc<TrafficMeters>,
    pub quit_tx: watch::Sender<bool>,
    pub quit: watch::Receiver<bool>,
}

pub fn sim_stack(len: u64, servers: Vec<SimServer>) -> SimStack {
    let data = sim_chain(len, len);
    let chain = Arc::new(LightChain::new());
    data.import_into(&chain).expect("import");
    let (quit_tx, quit) = watch::channel(false);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let peers = Arc::new(PeerSet::new());
    for server in &servers {
        peers
            .register(Peer::new(
                server.record,
                server.version,
                server.capacity,
                data.head(),
            ))
            .expect("register");
    }
    let network = SimNetwork::new(data.clone(), servers, events_tx);
    let meters = Arc::new(TrafficMeters::default());
    let distributor = RequestDistributor::spawn(Arc::clone(&peers), quit.clone());
    let pool = Arc::new(ServerPool::new(
        PoolConfig::default(),
        Arc::new(MemoryStore::new()),
    ));
    let retriever = RetrieveManager::new(
        RetrieveConfig {
            attempt_timeout: Duration::from_millis(500),
            retrieve_timeout: Duration::from_secs(3),
        },
        Arc::clone(&peers),
        distributor,
        pool,
        Arc::new(MeteredTransport::new(network, Arc::clone(&meters))),
        quit.clone(),
    );

    let demux = Arc::downgrade(&retriever);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let Some(retriever) = demux.upgrade() else {
                break;
            };
            if let NetworkEvent::Response {
                peer,
                request_id,
                response,
            } = event
            {
                retriever.deliver(peer, request_id, response);
            }
        }
    });

    SimStack {
        data,
        chain,
        store: Arc::new(MemoryStore::new()),
        peers,
        retriever,
        meters,
        quit_tx,
        quit,
    }
}

/// ODR facade over `stack` with every ready CHT and BloomTrie section confirmed.
pub fn sim_odr(stack: &SimStack) -> LesOdr {
    let cht = ChainIndexer::new(
        CHT_TEST,
        ChtIndexer::default(),
        stack.chain.clone(),
        stack.store.clone(),
    )
    .expect("cht indexer");
    cht.confirm_ready().expect("cht sections");
    let bloom_trie = ChainIndexer::new(
        BLOOM_TEST,
        BloomTrieIndexer::new(BLOOM_TEST.size),
        stack.chain.clone(),
        stack.store.clone(),
    )
    .expect("bloom trie indexer");
    bloom_trie.confirm_ready().expect("bloom trie sections");
    LesOdr::new(
        stack.chain.clone(),
        Arc::new(cht),
        Arc::new(bloom_trie),
        Arc::clone(&stack.retriever),
        16,
    )
}
