//! Subcommand handlers that inspect persisted state.

// CLI commands output directly to stdout for user feedback
#![allow(clippy::print_stdout, reason = "CLI commands require stdout output")]

use crate::cli::{InspectArgs, NodeConfig};
use crate::indexer::{
    stored_sections, BloomIndexer, BloomTrieIndexer, ChtIndexer, IndexerBackend, SectionConfig,
    StoredSections,
};
use crate::les::server_pool::{unix_ms, ServerPool};
use crate::storage::Storage;
use eyre::Result;
use serde::Serialize;

/// Handle the `pool` subcommand.
pub fn handle_pool(args: &InspectArgs, config: &NodeConfig) -> Result<()> {
    let storage = Storage::open(config)?;
    let pool = ServerPool::new(config.into(), storage.kv());
    pool.load()?;
    let mut entries = pool.snapshot();
    entries.sort_by(|a, b| b.score.total_cmp(&a.score));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Server pool at {} is empty.", storage.path().display());
        return Ok(());
    }
    let now = unix_ms();
    println!(
        "{:<18} {:<22} {:>6} {:>9} {:>5} {:>10}",
        "node", "address", "score", "latency", "fails", "cooldown"
    );
    for entry in &entries {
        let id = entry.record.id.to_string();
        let latency = entry
            .latency_ms
            .map(|ms| format!("{ms:.0}ms"))
            .unwrap_or_else(|| "-".to_string());
        let cooldown = match entry.cooldown_until_ms {
            Some(until) if until > now => format!("{}s", (until - now) / 1000),
            _ => "-".to_string(),
        };
        println!(
            "{:<18} {:<22} {:>6.3} {:>9} {:>5} {:>10}{}",
            &id[..id.len().min(18)],
            entry.record.addr,
            entry.score,
            latency,
            entry.consecutive_failures,
            cooldown,
            if entry.seed { "  seed" } else { "" }
        );
    }
    println!("\n{} server(s).", entries.len());
    Ok(())
}

#[derive(Debug, Serialize)]
struct SectionSummary {
    indexer: &'static str,
    section: SectionConfig,
    #[serde(flatten)]
    stored: StoredSections,
    indexed_blocks: u64,
}

/// Handle the `sections` subcommand.
pub fn handle_sections(args: &InspectArgs, config: &NodeConfig) -> Result<()> {
    let storage = Storage::open(config)?;
    let kv = storage.kv();
    let summaries = [
        (ChtIndexer::NAME, config.cht_section()),
        (BloomTrieIndexer::NAME, config.bloom_section()),
        (BloomIndexer::NAME, config.bloom_section()),
    ]
    .into_iter()
    .map(|(indexer, section)| {
        let stored = stored_sections(kv.as_ref(), indexer)?;
        Ok(SectionSummary {
            indexer,
            section,
            stored,
            indexed_blocks: stored.count * section.size,
        })
    })
    .collect::<Result<Vec<_>>>()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    for summary in &summaries {
        println!(
            "{:<10} {:>6} section(s) of {:>6} blocks, last head {}",
            summary.indexer, summary.stored.count, summary.section.size, summary.stored.last_head
        );
    }
    Ok(())
}
