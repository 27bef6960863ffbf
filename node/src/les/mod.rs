//! Light client side of the light-server protocol: peers, pool, request
//! distribution and verified on-demand retrieval.

pub mod backend;
pub mod bloom;
pub mod distributor;
pub mod odr;
pub mod peers;
pub mod request;
pub mod retrieve;
pub mod server_pool;
pub mod sim;
pub mod transport;

use alloy_primitives::{hex, B256, B512};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// 512-bit node public key.
pub type PeerId = B512;

pub const LPV1: u32 = 1;
pub const LPV2: u32 = 2;

/// Discovery topic advertised by servers of `protocol_version` on the chain
/// with the given genesis.
pub fn les_topic(genesis: B256, protocol_version: u32) -> Result<String, NodeRecordError> {
    let prefix = match protocol_version {
        LPV1 => "LES@",
        LPV2 => "LES2@",
        other => return Err(NodeRecordError::UnsupportedVersion(other)),
    };
    Ok(format!("{prefix}{}", hex::encode(&genesis[..8])))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeRecordError {
    #[error("missing enode:// scheme")]
    Scheme,
    #[error("invalid node id: {0}")]
    NodeId(String),
    #[error("invalid address: {0}")]
    Address(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

/// Dialable server address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enode://{}@{}", hex::encode(self.id), self.addr)
    }
}

impl FromStr for NodeRecord {
    type Err = NodeRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("enode://").ok_or(NodeRecordError::Scheme)?;
        let (id, addr) = rest
            .split_once('@')
            .ok_or_else(|| NodeRecordError::Address(rest.to_string()))?;
        let id = PeerId::from_str(id).map_err(|err| NodeRecordError::NodeId(err.to_string()))?;
        // Drop discovery query parameters such as `?discport=`.
        let addr = addr.split('?').next().unwrap_or(addr);
        let addr = addr
            .parse()
            .map_err(|_| NodeRecordError::Address(addr.to_string()))?;
        Ok(Self { id, addr })
    }
}

/// Built-in light servers used to seed an empty pool.
pub const DEFAULT_BOOTNODES: &[&str] = &[
    "enode://2a374a238067c41ed0cfb6c2f0b0361123b1b2e3286a1769b51981cac9200b1245e82e3769509311f04459bcb67a1d97a6ffbab980e99f42e48b3cb7df58b733@47.74.229.190:8080",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_uses_genesis_prefix() {
        let genesis = B256::from_str(
            "0xd4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3",
        )
        .expect("hash");
        assert_eq!(les_topic(genesis, LPV1).unwrap(), "LES@d4e56740f876aef8");
        assert_eq!(les_topic(genesis, LPV2).unwrap(), "LES2@d4e56740f876aef8");
        assert_eq!(
            les_topic(genesis, 3),
            Err(NodeRecordError::UnsupportedVersion(3))
        );
    }

    #[test]
    fn default_bootnodes_parse() {
        for node in DEFAULT_BOOTNODES {
            let record: NodeRecord = node.parse().expect("bootnode");
            assert_eq!(record.to_string(), *node);
        }
    }

    #[test]
    fn enode_parse_rejects_garbage() {
        assert_eq!(
            "http://x".parse::<NodeRecord>(),
            Err(NodeRecordError::Scheme)
        );
        assert!(matches!(
            "enode://abcd@1.2.3.4:30303".parse::<NodeRecord>(),
            Err(NodeRecordError::NodeId(_))
        ));
    }
}
