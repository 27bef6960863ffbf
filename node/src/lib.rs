//! Light client on-demand retrieval: a peer pool, capacity-aware request
//! distribution, verified retrieval and the section indexers whose roots
//! authenticate remote answers.

pub mod chain;
pub mod cli;
pub mod indexer;
pub mod les;
pub mod logging;
pub mod metrics;
pub mod proof;
pub mod run;
pub mod storage;

#[cfg(test)]
mod test_utils;
