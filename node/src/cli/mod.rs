//! CLI and config handling.

use crate::indexer::SectionConfig;
use crate::les::bloom::BloomServiceConfig;
use crate::les::odr::DEFAULT_HEADER_CACHE;
use crate::les::retrieve::RetrieveConfig;
use crate::les::server_pool::PoolConfig;
use crate::les::LPV2;
use alloy_primitives::B256;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_NETWORK_ID: u64 = 1;
/// Mainnet genesis.
pub const DEFAULT_GENESIS_HASH: &str =
    "0xd4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3";
pub const DEFAULT_LOG_JSON_FILTER: &str = "debug";
pub const DEFAULT_LIGHT_PEERS: usize = 5;
pub const DEFAULT_MAX_POOL_ENTRIES: usize = 200;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETRIEVE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CHT_SECTION_SIZE: u64 = 32_768;
pub const DEFAULT_CHT_CONFIRMATIONS: u64 = 2_048;
pub const DEFAULT_BLOOM_SECTION_SIZE: u64 = 4_096;
pub const DEFAULT_BLOOM_CONFIRMATIONS: u64 = 256;
pub const DEFAULT_BLOOM_THREADS: usize = 16;
pub const DEFAULT_BLOOM_BATCH: usize = 16;
pub const DEFAULT_BLOOM_WAIT_MS: u64 = 10;
pub const DEFAULT_SIM_SERVERS: usize = 8;
pub const DEFAULT_SIM_FAULTY: usize = 2;
/// Enough blocks for one CHT section and a few bloom sections at default geometry.
pub const DEFAULT_SIM_BLOCKS: u64 = 36_000;
pub const DEFAULT_SIM_LOOKUPS: usize = 32;

/// Light client configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(
    name = "odr-light-client",
    about = "Light client with verified on-demand retrieval",
    version
)]
pub struct NodeConfig {
    /// Network id recorded in storage on first start.
    #[arg(long, default_value_t = DEFAULT_NETWORK_ID)]
    pub network_id: u64,
    /// Genesis hash; selects the discovery topic.
    #[arg(long, default_value = DEFAULT_GENESIS_HASH)]
    pub genesis_hash: B256,
    /// Base data directory for node storage.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    /// Increase stdout verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbosity: u8,
    /// Write structured JSON logs to this file.
    #[arg(long)]
    pub log_json: Option<PathBuf>,
    /// Filter for the JSON log file.
    #[arg(long, default_value = DEFAULT_LOG_JSON_FILTER)]
    pub log_json_filter: String,
    /// Light protocol version to advertise and discover (1 or 2).
    #[arg(long, default_value_t = LPV2)]
    pub protocol_version: u32,
    /// Servers to keep connected.
    #[arg(long, default_value_t = DEFAULT_LIGHT_PEERS)]
    pub light_peers: usize,
    /// Candidate servers remembered by the pool.
    #[arg(long, default_value_t = DEFAULT_MAX_POOL_ENTRIES)]
    pub max_pool_entries: usize,
    /// Time one server has to answer a request.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
    /// Time a retrieval waits for an eligible server.
    #[arg(long, default_value_t = DEFAULT_RETRIEVE_TIMEOUT_MS)]
    pub retrieve_timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_CHT_SECTION_SIZE)]
    pub cht_section_size: u64,
    #[arg(long, default_value_t = DEFAULT_CHT_CONFIRMATIONS)]
    pub cht_confirmations: u64,
    #[arg(long, default_value_t = DEFAULT_BLOOM_SECTION_SIZE)]
    pub bloom_section_size: u64,
    #[arg(long, default_value_t = DEFAULT_BLOOM_CONFIRMATIONS)]
    pub bloom_confirmations: u64,
    /// Bloom retrieval workers.
    #[arg(long, default_value_t = DEFAULT_BLOOM_THREADS)]
    pub bloom_threads: usize,
    #[arg(long, default_value_t = DEFAULT_BLOOM_BATCH)]
    pub bloom_batch: usize,
    #[arg(long, default_value_t = DEFAULT_BLOOM_WAIT_MS)]
    pub bloom_wait_ms: u64,
    /// Headers fetched on demand kept in memory.
    #[arg(long, default_value_t = DEFAULT_HEADER_CACHE)]
    pub header_cache: usize,
    /// Extra enode URLs seeding the server pool.
    #[arg(long = "bootnode")]
    pub bootnodes: Vec<String>,
    /// Skip the built-in bootnodes.
    #[arg(long)]
    pub no_default_bootnodes: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Run against in-process simulated servers (default).
    Run(RunArgs),
    /// Print the persisted server pool.
    Pool(InspectArgs),
    /// Print persisted indexer checkpoints.
    Sections(InspectArgs),
}

impl Default for Command {
    fn default() -> Self {
        Self::Run(RunArgs::default())
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct RunArgs {
    /// Simulated servers.
    #[arg(long, default_value_t = DEFAULT_SIM_SERVERS)]
    pub simulate: usize,
    /// How many of them misbehave.
    #[arg(long, default_value_t = DEFAULT_SIM_FAULTY)]
    pub faulty: usize,
    /// Length of the synthetic chain.
    #[arg(long, default_value_t = DEFAULT_SIM_BLOCKS)]
    pub blocks: u64,
    /// Random historical lookups to perform.
    #[arg(long, default_value_t = DEFAULT_SIM_LOOKUPS)]
    pub lookups: usize,
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            simulate: DEFAULT_SIM_SERVERS,
            faulty: DEFAULT_SIM_FAULTY,
            blocks: DEFAULT_SIM_BLOCKS,
            lookups: DEFAULT_SIM_LOOKUPS,
            seed: 1,
        }
    }
}

#[derive(Args, Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

impl NodeConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn cht_section(&self) -> SectionConfig {
        SectionConfig {
            size: self.cht_section_size,
            confirmations: self.cht_confirmations,
        }
    }

    pub fn bloom_section(&self) -> SectionConfig {
        SectionConfig {
            size: self.bloom_section_size,
            confirmations: self.bloom_confirmations,
        }
    }
}

impl From<&NodeConfig> for PoolConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_entries: config.max_pool_entries,
            light_peers: config.light_peers,
            ..Self::default()
        }
    }
}

impl From<&NodeConfig> for RetrieveConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(config.request_timeout_ms),
            retrieve_timeout: Duration::from_millis(config.retrieve_timeout_ms),
        }
    }
}

impl From<&NodeConfig> for BloomServiceConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            threads: config.bloom_threads,
            batch: config.bloom_batch,
            wait: Duration::from_millis(config.bloom_wait_ms),
        }
    }
}
