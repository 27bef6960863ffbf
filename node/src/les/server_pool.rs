//! Ranked, persisted pool of candidate light servers.
//!
//! Scores are an exponentially weighted average of response quality in
//! `[0, 1]`. Consecutive failures beyond a threshold put an entry into
//! cool-down with exponential backoff; any success clears it.

use super::peers::PeerSet;
use super::transport::{Dialer, TopicDiscovery};
use super::{NodeRecord, PeerId};
use crate::storage::{decode_json, encode_json, KeyValueStore};
use alloy_primitives::hex;
use eyre::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const POOL_KEY_PREFIX: &str = "serverpool/";
const INITIAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries kept before least-value eviction.
    pub max_entries: usize,
    /// Servers to keep connected.
    pub light_peers: usize,
    /// EWMA weight of the newest outcome.
    pub score_alpha: f64,
    /// Latency at or below which a success scores 1.0.
    pub target_latency: Duration,
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    /// Persisted entries not seen for this long are dropped on load.
    pub entry_ttl: Duration,
    pub flush_interval: Duration,
    pub dial_interval: Duration,
    /// A dial without a handshake after this long counts as failed.
    pub handshake_timeout: Duration,
    pub discovery_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            light_peers: 5,
            score_alpha: 0.2,
            target_latency: Duration::from_millis(500),
            failure_threshold: 3,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(3600),
            entry_ttl: Duration::from_secs(7 * 24 * 3600),
            flush_interval: Duration::from_secs(60),
            dial_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            discovery_interval: Duration::from_secs(30),
        }
    }
}

/// Result of one interaction with a server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionOutcome {
    Success { latency: Duration },
    Timeout,
    InvalidResponse,
    ConnectFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub record: NodeRecord,
    pub score: f64,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub cooldown_until_ms: Option<u64>,
    pub last_seen_ms: u64,
    #[serde(default)]
    pub seed: bool,
    #[serde(skip)]
    pub connected: bool,
    /// When the pending dial started, until the handshake arrives.
    #[serde(skip)]
    pub dialing_since_ms: Option<u64>,
}

impl PoolEntry {
    fn new(record: NodeRecord, now_ms: u64, seed: bool) -> Self {
        Self {
            record,
            score: INITIAL_SCORE,
            latency_ms: None,
            consecutive_failures: 0,
            cooldown_until_ms: None,
            last_seen_ms: now_ms,
            seed,
            connected: false,
            dialing_since_ms: None,
        }
    }

    /// Connected or waiting for a handshake.
    pub fn is_busy(&self) -> bool {
        self.connected || self.dialing_since_ms.is_some()
    }

    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.cooldown_until_ms.is_some_and(|until| now_ms < until)
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Cool-down after `failures` consecutive failures, if any.
pub fn cooldown_for(config: &PoolConfig, failures: u32) -> Option<Duration> {
    if failures < config.failure_threshold.max(1) {
        return None;
    }
    let exponent = (failures - config.failure_threshold.max(1)).min(31);
    let backoff = config
        .base_cooldown
        .checked_mul(1u32 << exponent)
        .unwrap_or(config.max_cooldown);
    Some(backoff.min(config.max_cooldown))
}

/// Fold one outcome into `entry`'s score and failure streak.
fn apply_outcome(
    config: &PoolConfig,
    entry: &mut PoolEntry,
    outcome: ConnectionOutcome,
    now_ms: u64,
) {
    let alpha = config.score_alpha.clamp(0.0, 1.0);
    match outcome {
        ConnectionOutcome::Success { latency } => {
            let latency_ms = latency.as_secs_f64() * 1000.0;
            let target_ms = config.target_latency.as_secs_f64() * 1000.0;
            let quality = if latency_ms <= target_ms {
                1.0
            } else {
                target_ms / latency_ms
            };
            entry.score = (1.0 - alpha) * entry.score + alpha * quality;
            entry.latency_ms = Some(match entry.latency_ms {
                Some(prev) => (1.0 - alpha) * prev + alpha * latency_ms,
                None => latency_ms,
            });
            entry.consecutive_failures = 0;
            entry.cooldown_until_ms = None;
            entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
            return;
        }
        ConnectionOutcome::Timeout | ConnectionOutcome::ConnectFailed => {
            entry.score *= 1.0 - alpha;
        }
        ConnectionOutcome::InvalidResponse => {
            entry.score *= (1.0 - alpha) * (1.0 - alpha);
        }
    }
    entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
    if let Some(cooldown) = cooldown_for(config, entry.consecutive_failures) {
        entry.cooldown_until_ms = Some(now_ms.saturating_add(cooldown.as_millis() as u64));
        debug!(
            peer_id = %entry.record.id,
            failures = entry.consecutive_failures,
            cooldown_secs = cooldown.as_secs(),
            "server placed in cool-down"
        );
    }
}

fn pool_key(id: &PeerId) -> String {
    format!("{POOL_KEY_PREFIX}{}", hex::encode(id))
}

pub struct ServerPool {
    config: PoolConfig,
    store: Arc<dyn KeyValueStore>,
    entries: Mutex<HashMap<PeerId, PoolEntry>>,
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl ServerPool {
    pub fn new(config: PoolConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Load persisted entries, dropping those older than the TTL.
    pub fn load(&self) -> Result<usize> {
        self.load_at(unix_ms())
    }

    pub fn load_at(&self, now_ms: u64) -> Result<usize> {
        let expire_before = now_ms.saturating_sub(self.config.entry_ttl.as_millis() as u64);
        let mut loaded = 0;
        let mut expired = 0;
        for (key, value) in self.store.scan_prefix(POOL_KEY_PREFIX)? {
            let entry: PoolEntry = match decode_json(&value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable server pool entry");
                    self.store.delete(&key)?;
                    continue;
                }
            };
            if entry.last_seen_ms < expire_before && !entry.seed {
                self.store.delete(&key)?;
                expired += 1;
                continue;
            }
            self.insert_entry(entry);
            loaded += 1;
        }
        info!(loaded, expired, "server pool loaded");
        Ok(loaded)
    }

    pub fn add_seed(&self, record: NodeRecord) {
        self.touch(record, unix_ms(), true);
    }

    pub fn add_discovered(&self, record: NodeRecord) {
        self.touch(record, unix_ms(), false);
    }

    pub fn add_discovered_at(&self, record: NodeRecord, now_ms: u64) {
        self.touch(record, now_ms, false);
    }

    fn touch(&self, record: NodeRecord, now_ms: u64, seed: bool) {
        let evicted = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&record.id) {
                entry.record = record;
                entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
                entry.seed |= seed;
                return;
            }
            self.insert_locked(&mut entries, PoolEntry::new(record, now_ms, seed))
        };
        self.forget_evicted(evicted);
    }

    fn insert_entry(&self, entry: PoolEntry) {
        let evicted = self.insert_locked(&mut self.entries.lock(), entry);
        self.forget_evicted(evicted);
    }

    /// Insert `entry`, evicting the least valuable unconnected entry when full.
    /// Returns the evicted id.
    fn insert_locked(
        &self,
        entries: &mut HashMap<PeerId, PoolEntry>,
        entry: PoolEntry,
    ) -> Option<PeerId> {
        let mut evicted = None;
        if !entries.contains_key(&entry.record.id) && entries.len() >= self.config.max_entries {
            let victim = entries
                .values()
                .filter(|candidate| !candidate.is_busy())
                .min_by(|a, b| {
                    a.score
                        .total_cmp(&b.score)
                        .then(a.last_seen_ms.cmp(&b.last_seen_ms))
                })
                .map(|victim| (victim.record.id, victim.score, victim.last_seen_ms));
            match victim {
                Some((id, score, last_seen))
                    if (score, last_seen) <= (entry.score, entry.last_seen_ms) =>
                {
                    entries.remove(&id);
                    evicted = Some(id);
                }
                _ => {
                    debug!(peer_id = %entry.record.id, "server pool full, candidate dropped");
                    return None;
                }
            }
        }
        entries.insert(entry.record.id, entry);
        evicted
    }

    fn forget_evicted(&self, evicted: Option<PeerId>) {
        let Some(id) = evicted else {
            return;
        };
        debug!(peer_id = %id, "evicted least valuable server");
        if let Err(err) = self.store.delete(&pool_key(&id)) {
            warn!(peer_id = %id, error = %err, "failed to delete evicted server entry");
        }
    }

    /// Best candidate that is neither connected nor cooling down.
    pub fn suggest_peer(&self) -> Option<NodeRecord> {
        self.suggest_peer_at(unix_ms())
    }

    pub fn suggest_peer_at(&self, now_ms: u64) -> Option<NodeRecord> {
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.is_busy() && !entry.in_cooldown(now_ms))
            .max_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then(a.last_seen_ms.cmp(&b.last_seen_ms))
            })
            .map(|entry| entry.record)
    }

    pub fn update_score(&self, id: &PeerId, outcome: ConnectionOutcome) {
        self.update_score_at(id, outcome, unix_ms());
    }

    pub fn update_score_at(&self, id: &PeerId, outcome: ConnectionOutcome, now_ms: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            debug!(peer_id = %id, ?outcome, "score update for unknown server");
            return;
        };
        apply_outcome(&self.config, entry, outcome, now_ms);
    }

    pub fn mark_connected(&self, id: &PeerId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.connected = true;
            entry.dialing_since_ms = None;
        }
    }

    pub fn mark_disconnected(&self, id: &PeerId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.connected = false;
            entry.dialing_since_ms = None;
        }
    }

    pub fn mark_dialing_at(&self, id: &PeerId, now_ms: u64) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.dialing_since_ms = Some(now_ms);
        }
    }

    /// Fail dials whose handshake never arrived. Returns how many expired.
    pub fn expire_dials_at(&self, now_ms: u64) -> usize {
        let timeout_ms = self.config.handshake_timeout.as_millis() as u64;
        let mut entries = self.entries.lock();
        let mut expired = 0;
        for entry in entries.values_mut() {
            let Some(since) = entry.dialing_since_ms else {
                continue;
            };
            if now_ms.saturating_sub(since) < timeout_ms {
                continue;
            }
            entry.dialing_since_ms = None;
            apply_outcome(&self.config, entry, ConnectionOutcome::ConnectFailed, now_ms);
            debug!(peer_id = %entry.record.id, "handshake timed out");
            expired += 1;
        }
        expired
    }

    /// Servers connected or with a dial in flight.
    pub fn connected_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_busy())
            .count()
    }

    pub fn entry(&self, id: &PeerId) -> Option<PoolEntry> {
        self.entries.lock().get(id).cloned()
    }

    /// Entries ordered by descending score.
    pub fn snapshot(&self) -> Vec<PoolEntry> {
        let mut entries: Vec<PoolEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| b.score.total_cmp(&a.score));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<()> {
        let entries: Vec<PoolEntry> = self.entries.lock().values().cloned().collect();
        let count = entries.len();
        let batch = entries
            .iter()
            .map(|entry| Ok((pool_key(&entry.record.id), encode_json(entry)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store.put_batch(batch)?;
        self.store.flush()?;
        debug!(entries = count, "server pool flushed");
        Ok(())
    }

    async fn dial_more(&self, dialer: &dyn Dialer, peers: &PeerSet) {
        self.expire_dials_at(unix_ms());
        while self.connected_count().max(peers.len()) < self.config.light_peers {
            let now_ms = unix_ms();
            let Some(record) = self.suggest_peer_at(now_ms) else {
                break;
            };
            self.mark_dialing_at(&record.id, now_ms);
            debug!(peer_id = %record.id, addr = %record.addr, "dialing server");
            if let Err(err) = dialer.dial(&record).await {
                debug!(peer_id = %record.id, error = %err, "dial failed");
                self.update_score(&record.id, ConnectionOutcome::ConnectFailed);
                self.mark_disconnected(&record.id);
            }
        }
    }

    /// Run discovery, dialing and periodic flushing until `quit` flips.
    pub fn spawn(
        self: Arc<Self>,
        topic: String,
        discovery: Arc<dyn TopicDiscovery>,
        dialer: Arc<dyn Dialer>,
        peers: Arc<PeerSet>,
        mut quit: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut discovery_tick = tokio::time::interval(self.config.discovery_interval);
            let mut dial_tick = tokio::time::interval(self.config.dial_interval);
            let mut flush_tick = tokio::time::interval(self.config.flush_interval);
            for tick in [&mut discovery_tick, &mut dial_tick, &mut flush_tick] {
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
            info!(%topic, "server pool started");
            loop {
                if *quit.borrow() {
                    break;
                }
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = discovery_tick.tick() => match discovery.lookup(&topic).await {
                        Ok(records) => {
                            debug!(found = records.len(), "topic lookup finished");
                            for record in records {
                                self.add_discovered(record);
                            }
                        }
                        Err(err) => warn!(error = %err, "topic lookup failed"),
                    },
                    _ = dial_tick.tick() => self.dial_more(dialer.as_ref(), &peers).await,
                    _ = flush_tick.tick() => {
                        if let Err(err) = self.flush() {
                            warn!(error = %err, "server pool flush failed");
                        }
                    }
                }
            }
            if let Err(err) = self.flush() {
                warn!(error = %err, "server pool flush on shutdown failed");
            }
            info!("server pool stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::test_utils::node_record;

    fn pool_with(config: PoolConfig) -> (ServerPool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ServerPool::new(config, store.clone()), store)
    }

    #[test]
    fn cooldown_is_deterministic_in_failure_count() {
        let config = PoolConfig::default();
        assert_eq!(cooldown_for(&config, 2), None);
        assert_eq!(cooldown_for(&config, 3), Some(Duration::from_secs(30)));
        assert_eq!(cooldown_for(&config, 5), Some(Duration::from_secs(120)));
        assert_eq!(cooldown_for(&config, 40), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn consecutive_failures_exclude_then_success_restores() {
        let (pool, _) = pool_with(PoolConfig::default());
        let record = node_record(1);
        pool.add_discovered_at(record, 1_000);

        for _ in 0..2 {
            pool.update_score_at(&record.id, ConnectionOutcome::Timeout, 1_000);
        }
        assert_eq!(pool.suggest_peer_at(1_000), Some(record));
        pool.update_score_at(&record.id, ConnectionOutcome::InvalidResponse, 1_000);
        assert_eq!(pool.suggest_peer_at(1_000), None);
        assert_eq!(pool.suggest_peer_at(1_000 + 30_000), Some(record));

        pool.update_score_at(
            &record.id,
            ConnectionOutcome::Success {
                latency: Duration::from_millis(100),
            },
            2_000,
        );
        let entry = pool.entry(&record.id).expect("entry");
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.cooldown_until_ms, None);
    }

    #[test]
    fn outcome_order_is_reflected_in_state() {
        let (a, _) = pool_with(PoolConfig::default());
        let (b, _) = pool_with(PoolConfig::default());
        let record = node_record(1);
        a.add_discovered_at(record, 0);
        b.add_discovered_at(record, 0);
        let ok = ConnectionOutcome::Success {
            latency: Duration::from_millis(10),
        };
        a.update_score_at(&record.id, ok, 0);
        a.update_score_at(&record.id, ConnectionOutcome::Timeout, 0);
        b.update_score_at(&record.id, ConnectionOutcome::Timeout, 0);
        b.update_score_at(&record.id, ok, 0);

        assert_eq!(a.entry(&record.id).unwrap().consecutive_failures, 1);
        assert_eq!(b.entry(&record.id).unwrap().consecutive_failures, 0);
        assert!(a.entry(&record.id).unwrap().cooldown_until_ms.is_none());
    }

    #[test]
    fn suggest_prefers_score_then_recency_and_skips_connected() {
        let (pool, _) = pool_with(PoolConfig::default());
        let (old, fresh, best) = (node_record(1), node_record(2), node_record(3));
        pool.add_discovered_at(old, 10);
        pool.add_discovered_at(fresh, 20);
        pool.add_discovered_at(best, 5);
        assert_eq!(pool.suggest_peer_at(100), Some(fresh));

        pool.update_score_at(
            &best.id,
            ConnectionOutcome::Success {
                latency: Duration::from_millis(1),
            },
            5,
        );
        assert_eq!(pool.suggest_peer_at(100), Some(best));
        pool.mark_connected(&best.id);
        assert_eq!(pool.suggest_peer_at(100), Some(fresh));
    }

    #[test]
    fn eviction_drops_least_valuable_unconnected_entry() {
        let config = PoolConfig {
            max_entries: 2,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let (a, b, c) = (node_record(1), node_record(2), node_record(3));
        pool.add_discovered_at(a, 10);
        pool.add_discovered_at(b, 20);
        pool.mark_connected(&a.id);
        pool.add_discovered_at(c, 30);

        assert_eq!(pool.len(), 2);
        assert!(pool.entry(&a.id).is_some());
        assert!(pool.entry(&b.id).is_none());
        assert!(pool.entry(&c.id).is_some());
    }

    #[test]
    fn flush_and_load_roundtrip_with_ttl() {
        let store = Arc::new(MemoryStore::new());
        let config = PoolConfig {
            entry_ttl: Duration::from_secs(10),
            ..PoolConfig::default()
        };
        let pool = ServerPool::new(config.clone(), store.clone());
        let (stale, live) = (node_record(1), node_record(2));
        pool.add_discovered_at(stale, 1_000);
        pool.add_discovered_at(live, 50_000);
        pool.mark_connected(&live.id);
        pool.update_score_at(&live.id, ConnectionOutcome::Timeout, 50_000);
        pool.flush().expect("flush");

        let reloaded = ServerPool::new(config, store.clone());
        assert_eq!(reloaded.load_at(55_000).expect("load"), 1);
        let entry = reloaded.entry(&live.id).expect("live entry");
        assert!(!entry.connected);
        assert_eq!(entry.consecutive_failures, 1);
        assert!(reloaded.entry(&stale.id).is_none());
        assert_eq!(
            store.scan_prefix(POOL_KEY_PREFIX).unwrap().len(),
            1
        );
    }

    /// Accepts every dial but never completes a handshake.
    #[derive(Default)]
    struct HangingDialer {
        dialed: Mutex<Vec<PeerId>>,
    }

    #[async_trait::async_trait]
    impl Dialer for HangingDialer {
        async fn dial(&self, record: &NodeRecord) -> Result<()> {
            self.dialed.lock().push(record.id);
            Ok(())
        }
    }

    #[test]
    fn unanswered_dial_expires_as_connect_failure() {
        let config = PoolConfig {
            handshake_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let record = node_record(1);
        pool.add_discovered_at(record, 1_000);
        pool.mark_dialing_at(&record.id, 1_000);
        assert_eq!(pool.connected_count(), 1);
        assert_eq!(pool.suggest_peer_at(1_000), None);

        assert_eq!(pool.expire_dials_at(5_999), 0);
        assert_eq!(pool.expire_dials_at(6_000), 1);
        let entry = pool.entry(&record.id).expect("entry");
        assert_eq!(entry.dialing_since_ms, None);
        assert!(!entry.connected);
        assert_eq!(entry.consecutive_failures, 1);
        assert!(entry.score < 0.5);
        assert_eq!(pool.connected_count(), 0);
        assert_eq!(pool.suggest_peer_at(6_000), Some(record));

        pool.mark_dialing_at(&record.id, 7_000);
        pool.mark_connected(&record.id);
        assert_eq!(pool.expire_dials_at(60_000), 0);
        assert!(pool.entry(&record.id).expect("entry").connected);
    }

    #[tokio::test]
    async fn dial_loop_moves_on_when_handshake_never_arrives() {
        let config = PoolConfig {
            light_peers: 1,
            handshake_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let (first, second) = (node_record(1), node_record(2));
        let now = unix_ms();
        pool.add_discovered_at(first, now);
        pool.add_discovered_at(second, now - 1);
        let dialer = HangingDialer::default();
        let peers = PeerSet::new();

        pool.dial_more(&dialer, &peers).await;
        pool.dial_more(&dialer, &peers).await;
        assert_eq!(*dialer.dialed.lock(), vec![first.id]);

        tokio::time::sleep(Duration::from_millis(80)).await;
        pool.dial_more(&dialer, &peers).await;
        assert_eq!(*dialer.dialed.lock(), vec![first.id, second.id]);
        assert_eq!(pool.entry(&first.id).expect("first").consecutive_failures, 1);
        assert_eq!(pool.connected_count(), 1);
    }

    #[test]
    fn concurrent_adds_of_one_server_merge() {
        let (pool, _) = pool_with(PoolConfig::default());
        let record = node_record(4);
        std::thread::scope(|scope| {
            for round in 0..8u64 {
                let pool = &pool;
                scope.spawn(move || {
                    if round % 2 == 0 {
                        pool.add_seed(record);
                    } else {
                        pool.add_discovered_at(record, u64::MAX - round);
                    }
                });
            }
        });
        assert_eq!(pool.len(), 1);
        let entry = pool.entry(&record.id).expect("entry");
        assert!(entry.seed);
        assert_eq!(entry.last_seen_ms, u64::MAX - 1);
    }
}
