//! `run`: drive the light client against in-process simulated servers.
//!
//! A synthetic chain is generated and imported as if header sync had
//! happened, the indexers confirm what they can, headers below the confirmed
//! sections are pruned, and random historical lookups then exercise the full
//! ODR path.

use crate::chain::ChainReader;
use crate::cli::{NodeConfig, RunArgs};
use crate::indexer::SectionConfig;
use crate::les::backend::LightClient;
use crate::les::odr::Source;
use crate::les::sim::{generate_servers, sim_contract, SimChain, SimNetwork, SIM_CONTRACTS};
use crate::metrics::{rate_per_sec, TrafficSnapshot};
use crate::storage::Storage;
use eyre::{eyre, Result, WrapErr};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub blocks: u64,
    pub servers: usize,
    pub faulty: usize,
    pub connected_peers: usize,
    pub cht_sections: u64,
    pub bloom_sections: u64,
    pub pruned_headers: usize,
    pub header_lookups: u64,
    pub header_failures: u64,
    pub remote_headers: u64,
    pub receipt_lookups: u64,
    pub receipt_failures: u64,
    /// Blocks the bloom filter flagged.
    pub bloom_candidates: u64,
    /// Flagged blocks that really carry a matching log.
    pub bloom_hits: u64,
    pub bloom_local_vectors: u64,
    pub bloom_remote_vectors: u64,
    pub traffic: TrafficSnapshot,
    pub elapsed_ms: u64,
    pub requests_per_sec: Option<f64>,
}

/// Sections of `config` confirmable once the head reaches `head`.
pub fn ready_sections(config: SectionConfig, head: u64) -> u64 {
    let first = config.required_head(0);
    if head < first {
        return 0;
    }
    (head - first) / config.size + 1
}

async fn settle(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let started = Instant::now();
    while !done() {
        if started.elapsed() > SETTLE_TIMEOUT {
            return Err(eyre!("timed out waiting for {what}"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

pub async fn run_simulation(
    config: &NodeConfig,
    args: &RunArgs,
    storage: Storage,
) -> Result<SimulationReport> {
    let started = Instant::now();
    if args.simulate == 0 {
        return Err(eyre!("--simulate needs at least one server"));
    }
    let faulty = if args.faulty > args.simulate {
        warn!(faulty = args.faulty, servers = args.simulate, "more faulty servers than servers");
        args.simulate
    } else {
        args.faulty
    };

    let (cht, bloom, blocks, seed) = (
        config.cht_section(),
        config.bloom_section(),
        args.blocks,
        args.seed,
    );
    info!(blocks, seed, "generating synthetic chain");
    let data = tokio::task::spawn_blocking(move || SimChain::generate(blocks, seed, cht, bloom))
        .await
        .wrap_err("chain generation panicked")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let network = SimNetwork::new(
        data.clone(),
        generate_servers(args.simulate, faulty, seed),
        events_tx,
    );
    let client = Arc::new(LightClient::new(
        config,
        storage,
        network.clone(),
        network.clone(),
        network,
    )?);
    data.import_into(client.chain())
        .wrap_err("failed to import synthetic headers")?;
    client.start(events_rx)?;

    let outcome = tokio::select! {
        report = exercise(&client, &data, config, args, faulty) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
            Err(eyre!("interrupted"))
        }
    };
    let stopped = client.stop().await;
    let mut report = outcome?;
    stopped?;
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

async fn exercise(
    client: &Arc<LightClient>,
    data: &SimChain,
    config: &NodeConfig,
    args: &RunArgs,
    faulty: usize,
) -> Result<SimulationReport> {
    let head = client
        .chain()
        .head()
        .map(|head| head.number)
        .ok_or_else(|| eyre!("empty synthetic chain"))?;
    let want_peers = config.light_peers.min(args.simulate);
    let want_cht = ready_sections(config.cht_section(), head);
    let want_bloom = ready_sections(config.bloom_section(), head);

    settle("peers", || client.peers().len() >= want_peers).await?;
    settle("indexers", || {
        client.cht().sections().count >= want_cht && client.bloom_status().1 >= want_bloom
    })
    .await?;
    let pruned_headers = client.prune_confirmed();
    info!(
        peers = client.peers().len(),
        cht_sections = want_cht,
        bloom_sections = want_bloom,
        pruned_headers,
        "simulation ready"
    );

    let mut report = SimulationReport {
        blocks: data.len(),
        servers: args.simulate,
        faulty,
        connected_peers: client.peers().len(),
        cht_sections: want_cht,
        bloom_sections: want_bloom,
        pruned_headers,
        ..SimulationReport::default()
    };

    let lookup_started = Instant::now();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let odr = client.odr();
    for _ in 0..args.lookups {
        let number = rng.gen_range(0..data.len());
        report.header_lookups += 1;
        match odr.header_by_number(number).await {
            Ok(fetched) if fetched.value.header == *data.header(number) => {
                if matches!(fetched.source, Source::Peer(_)) {
                    report.remote_headers += 1;
                }
            }
            Ok(_) => {
                report.header_failures += 1;
                warn!(number, "header differs from the synthetic chain");
            }
            Err(err) => {
                report.header_failures += 1;
                warn!(number, error = %err, "header lookup failed");
            }
        }

        report.receipt_lookups += 1;
        match odr.block_receipts(number).await {
            Ok(fetched) if fetched.value == data.receipts(number) => {}
            Ok(_) => report.receipt_failures += 1,
            Err(err) => {
                report.receipt_failures += 1;
                warn!(number, error = %err, "receipt lookup failed");
            }
        }
    }

    let bloom = client.bloom_service();
    for index in 0..SIM_CONTRACTS {
        let address = sim_contract(index);
        let actual = data.blocks_with_log(address);
        for section in 0..want_bloom {
            match bloom.filter_section(address.as_slice(), section).await {
                Ok(candidates) => {
                    report.bloom_candidates += candidates.len() as u64;
                    report.bloom_hits +=
                        candidates.iter().filter(|n| actual.contains(n)).count() as u64;
                }
                Err(err) => warn!(section, error = %err, "bloom filter failed"),
            }
        }
    }
    (report.bloom_local_vectors, report.bloom_remote_vectors) = bloom.stats();
    report.traffic = client.meters().snapshot();
    report.requests_per_sec = rate_per_sec(report.traffic.out_packets, lookup_started.elapsed());
    info!(
        header_failures = report.header_failures,
        receipt_failures = report.receipt_failures,
        out_packets = report.traffic.out_packets,
        "lookups finished"
    );
    Ok(report)
}
