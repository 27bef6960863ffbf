//! Light client wiring: owns every long-lived component and the tasks that
//! drive them, and translates networking events into peer set, pool and
//! retrieval updates.

use super::bloom::{start_bloom_handlers, BloomService};
use super::distributor::RequestDistributor;
use super::odr::LesOdr;
use super::peers::{Peer, PeerSet, PeerSetError};
use super::request::ProtocolResponse;
use super::retrieve::RetrieveManager;
use super::server_pool::ServerPool;
use super::transport::{
    Dialer, Handshake, MeteredTransport, NetworkEvent, TopicDiscovery, Transport,
};
use super::{les_topic, NodeRecord, PeerId, DEFAULT_BOOTNODES, LPV1, LPV2};
use crate::chain::{ChainEvent, ChainHead, ChainReader, LightChain};
use crate::cli::NodeConfig;
use crate::indexer::{BloomIndexer, BloomTrieIndexer, ChainIndexer, ChtIndexer};
use crate::metrics::TrafficMeters;
use crate::storage::Storage;
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct Tasks {
    events: Option<JoinHandle<()>>,
    pool: Option<JoinHandle<()>>,
    indexers: Vec<JoinHandle<()>>,
}

pub struct LightClient {
    config: NodeConfig,
    storage: Storage,
    chain: Arc<LightChain>,
    peers: Arc<PeerSet>,
    pool: Arc<ServerPool>,
    distributor: Arc<RequestDistributor>,
    retriever: Arc<RetrieveManager>,
    odr: Arc<LesOdr>,
    cht: Arc<ChainIndexer<ChtIndexer>>,
    bloom_trie: Arc<ChainIndexer<BloomTrieIndexer>>,
    bloom: Arc<ChainIndexer<BloomIndexer>>,
    bloom_service: BloomService,
    meters: Arc<TrafficMeters>,
    topic: String,
    dialer: Arc<dyn Dialer>,
    discovery: Arc<dyn TopicDiscovery>,
    quit_tx: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl std::fmt::Debug for LightClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightClient")
            .field("topic", &self.topic)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl LightClient {
    /// Build every component. Background tasks only run after [`start`](Self::start).
    pub fn new(
        config: &NodeConfig,
        storage: Storage,
        transport: Arc<dyn Transport>,
        dialer: Arc<dyn Dialer>,
        discovery: Arc<dyn TopicDiscovery>,
    ) -> Result<Self> {
        let topic = les_topic(config.genesis_hash, config.protocol_version)
            .wrap_err("invalid protocol version")?;
        let (quit_tx, quit) = watch::channel(false);
        let store = storage.kv();
        let chain = Arc::new(LightChain::new());
        let reader: Arc<dyn ChainReader> = chain.clone();

        let cht = Arc::new(ChainIndexer::new(
            config.cht_section(),
            ChtIndexer::default(),
            Arc::clone(&reader),
            Arc::clone(&store),
        )?);
        let bloom_section = config.bloom_section();
        let bloom_trie = Arc::new(ChainIndexer::new(
            bloom_section,
            BloomTrieIndexer::new(bloom_section.size),
            Arc::clone(&reader),
            Arc::clone(&store),
        )?);
        let bloom = Arc::new(ChainIndexer::new(
            bloom_section,
            BloomIndexer::new(bloom_section.size),
            Arc::clone(&reader),
            Arc::clone(&store),
        )?);

        let meters = Arc::new(TrafficMeters::default());
        let peers = Arc::new(PeerSet::new());
        let pool = Arc::new(ServerPool::new(config.into(), Arc::clone(&store)));
        let distributor = RequestDistributor::spawn(Arc::clone(&peers), quit.clone());
        let transport: Arc<dyn Transport> =
            Arc::new(MeteredTransport::new(transport, Arc::clone(&meters)));
        let retriever = RetrieveManager::new(
            config.into(),
            Arc::clone(&peers),
            Arc::clone(&distributor),
            Arc::clone(&pool),
            transport,
            quit.clone(),
        );
        let odr = Arc::new(LesOdr::new(
            reader,
            Arc::clone(&cht),
            Arc::clone(&bloom_trie),
            Arc::clone(&retriever),
            config.header_cache,
        ));
        let bloom_service = start_bloom_handlers(config.into(), Arc::clone(&odr), store, quit);

        Ok(Self {
            config: config.clone(),
            storage,
            chain,
            peers,
            pool,
            distributor,
            retriever,
            odr,
            cht,
            bloom_trie,
            bloom,
            bloom_service,
            meters,
            topic,
            dialer,
            discovery,
            quit_tx,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Seed the pool, start the indexers, the pool loop and the event loop.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<NetworkEvent>) -> Result<()> {
        let restored = self.pool.load().wrap_err("failed to load server pool")?;
        let mut seeds = 0usize;
        for record in self.bootnodes()? {
            self.pool.add_seed(record);
            seeds += 1;
        }
        info!(restored, seeds, topic = %self.topic, "server pool seeded");

        let quit = self.quit_tx.subscribe();
        let mut tasks = self.tasks.lock();
        tasks.indexers = vec![
            Arc::clone(&self.cht).spawn(quit.clone()),
            Arc::clone(&self.bloom_trie).spawn(quit.clone()),
            Arc::clone(&self.bloom).spawn(quit.clone()),
        ];
        tasks.pool = Some(Arc::clone(&self.pool).spawn(
            self.topic.clone(),
            Arc::clone(&self.discovery),
            Arc::clone(&self.dialer),
            Arc::clone(&self.peers),
            quit.clone(),
        ));

        let client = Arc::clone(self);
        let mut quit = quit;
        tasks.events = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => client.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("network event loop stopped");
        }));
        info!(
            network_id = self.config.network_id,
            protocol_version = self.config.protocol_version,
            "light client started"
        );
        Ok(())
    }

    fn bootnodes(&self) -> Result<Vec<NodeRecord>> {
        let defaults = if self.config.no_default_bootnodes {
            &[][..]
        } else {
            DEFAULT_BOOTNODES
        };
        defaults
            .iter()
            .copied()
            .chain(self.config.bootnodes.iter().map(String::as_str))
            .map(|node| {
                node.parse::<NodeRecord>()
                    .wrap_err_with(|| format!("invalid bootnode {node}"))
            })
            .collect()
    }

    pub fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected(handshake) => self.handle_peer_connected(handshake),
            NetworkEvent::Disconnected(id) => self.handle_peer_disconnected(&id),
            NetworkEvent::HeadAnnounced { peer, head } => {
                if self.peers.update_head(&peer, head).is_err() {
                    trace!(peer_id = %peer, "head from unknown peer");
                }
            }
            NetworkEvent::Response {
                peer,
                request_id,
                response,
            } => self.handle_response(peer, request_id, response),
        }
    }

    pub fn handle_peer_connected(&self, handshake: Handshake) {
        let id = handshake.record.id;
        if !(LPV1..=LPV2).contains(&handshake.version) {
            warn!(peer_id = %id, version = handshake.version, "unsupported protocol version");
            self.pool.mark_disconnected(&id);
            return;
        }
        // Inbound servers are not in the pool yet.
        if self.pool.entry(&id).is_none() {
            self.pool.add_discovered(handshake.record);
        }
        self.pool.mark_connected(&id);
        let peer = Peer::new(
            handshake.record,
            handshake.version,
            handshake.capacity,
            handshake.head,
        );
        match self.peers.register(peer) {
            Ok(peer) => info!(
                peer_id = %peer.id,
                version = peer.version,
                capacity = peer.capacity(),
                head = peer.head().number,
                "light server connected"
            ),
            Err(PeerSetError::AlreadyRegistered(id)) => {
                debug!(peer_id = %id, "duplicate handshake ignored");
            }
            Err(err) => warn!(error = %err, "peer registration failed"),
        }
    }

    pub fn handle_peer_disconnected(&self, id: &PeerId) {
        self.pool.mark_disconnected(id);
        match self.peers.unregister(id) {
            Ok(_) => info!(peer_id = %id, "light server disconnected"),
            Err(err) => trace!(error = %err, "disconnect of unregistered peer"),
        }
    }

    pub fn handle_response(&self, peer: PeerId, request_id: u64, response: ProtocolResponse) {
        self.meters.ingress.mark(response.wire_size());
        if !self.retriever.deliver(peer, request_id, response) {
            trace!(peer_id = %peer, request_id, "response not matched");
        }
    }

    /// Bloom trie section size and the number of confirmed sections.
    pub fn bloom_status(&self) -> (u64, u64) {
        (
            self.bloom_trie.section_config().size,
            self.bloom_trie.sections().count,
        )
    }

    pub fn subscribe_chain_head(&self) -> watch::Receiver<Option<ChainHead>> {
        self.chain.subscribe_head()
    }

    pub fn subscribe_chain_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain.subscribe_events()
    }

    /// Drop local headers every indexer has already summarized.
    pub fn prune_confirmed(&self) -> usize {
        let cht = self.cht.sections().count * self.cht.section_config().size;
        let bloom_size = self.bloom.section_config().size;
        let bloom = self.bloom.sections().count.min(self.bloom_trie.sections().count) * bloom_size;
        self.chain.prune_below(cht.min(bloom))
    }

    pub fn chain(&self) -> &Arc<LightChain> {
        &self.chain
    }

    pub fn odr(&self) -> &Arc<LesOdr> {
        &self.odr
    }

    pub fn bloom_service(&self) -> &BloomService {
        &self.bloom_service
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn meters(&self) -> &Arc<TrafficMeters> {
        &self.meters
    }

    pub fn cht(&self) -> &Arc<ChainIndexer<ChtIndexer>> {
        &self.cht
    }

    /// Stop every task, then flush the pool and the store.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping light client");
        let _ = self.quit_tx.send(true);
        let (events, pool, indexers) = {
            let mut tasks = self.tasks.lock();
            (
                tasks.events.take(),
                tasks.pool.take(),
                std::mem::take(&mut tasks.indexers),
            )
        };

        self.bloom_service.join().await;
        self.distributor.join().await;
        for handle in indexers {
            let _ = handle.await;
        }
        if let Some(handle) = events {
            let _ = handle.await;
        }
        debug!(pending = self.retriever.pending_len(), "retrievals drained");
        match pool {
            Some(handle) => {
                let _ = handle.await;
            }
            None => self.pool.flush().wrap_err("failed to flush server pool")?,
        }
        self.storage.flush().wrap_err("failed to flush storage")?;
        info!("light client stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::stored_sections;
    use crate::les::odr::Source;
    use crate::les::server_pool::PoolConfig;
    use crate::les::sim::{generate_servers, sim_contract, SimNetwork};
    use crate::test_utils::{base_config, sim_chain, temp_dir, test_peer};
    use std::time::Duration;

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn end_to_end_over_simulated_servers() {
        let dir = temp_dir("backend-e2e");
        let config = base_config(dir.clone());
        let data = sim_chain(48, 21);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let network = SimNetwork::new(data.clone(), generate_servers(4, 1, 3), events_tx);

        let storage = Storage::open(&config).expect("storage");
        let client = Arc::new(
            LightClient::new(
                &config,
                storage,
                network.clone(),
                network.clone(),
                network.clone(),
            )
            .expect("client"),
        );
        data.import_into(client.chain()).expect("import");
        assert_eq!(*client.subscribe_chain_head().borrow(), Some(data.head()));
        client.start(events_rx).expect("start");

        assert!(wait_for(|| client.peers().len() == 4).await, "peers connected");
        assert!(wait_for(|| client.bloom_status() == (16, 2)).await, "bloom sections");
        assert!(wait_for(|| client.cht().sections().count == 5).await, "cht sections");
        assert!(wait_for(|| client.bloom.sections().count == 2).await, "bloom bits");
        assert_eq!(client.prune_confirmed(), 32);

        let header = client.odr().header_by_number(5).await.expect("header");
        assert!(matches!(header.source, Source::Peer(_)));
        assert_eq!(header.value.header, data.header(5).clone());

        let receipts = client.odr().block_receipts(20).await.expect("receipts");
        assert_eq!(receipts.value, data.receipts(20));

        let address = sim_contract(1);
        let candidates = client
            .bloom_service()
            .filter_section(address.as_slice(), 1)
            .await
            .expect("filter");
        for number in data.blocks_with_log(address).into_iter().filter(|n| (16..32).contains(n)) {
            assert!(candidates.contains(&number));
        }

        let traffic = client.meters().snapshot();
        assert!(traffic.out_packets >= 2);
        assert!(traffic.in_packets >= 2);

        client.stop().await.expect("stop");
        drop(client);

        let storage = Storage::open(&config).expect("reopen");
        let pool = ServerPool::new(PoolConfig::default(), storage.kv());
        assert_eq!(pool.load().expect("load"), 4);
        assert_eq!(
            stored_sections(storage.kv().as_ref(), "cht").expect("cht").count,
            5
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disconnect_unregisters_and_frees_pool_slot() {
        let dir = temp_dir("backend-disconnect");
        let config = base_config(dir.clone());
        let data = sim_chain(8, 2);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let network = SimNetwork::new(data, Vec::new(), events_tx);
        let client = LightClient::new(
            &config,
            Storage::open(&config).expect("storage"),
            network.clone(),
            network.clone(),
            network,
        )
        .expect("client");

        let peer = test_peer(7, 2, 10);
        let handshake = Handshake {
            record: peer.record,
            version: LPV2,
            capacity: 2,
            head: peer.head(),
        };
        client.handle_peer_connected(handshake.clone());
        client.handle_peer_connected(handshake);
        assert_eq!(client.peers().len(), 1);
        assert!(client.pool().entry(&peer.id).expect("entry").connected);

        client.handle_peer_disconnected(&peer.id);
        assert!(client.peers().is_empty());
        assert!(!client.pool().entry(&peer.id).expect("entry").connected);

        client.handle_peer_connected(Handshake {
            record: peer.record,
            version: 9,
            capacity: 1,
            head: peer.head(),
        });
        assert!(client.peers().is_empty());
        client.stop().await.expect("stop");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
