//! Canonical hash trie: one leaf per block committing to its hash and total difficulty.

use super::IndexerBackend;
use crate::chain::Header;
use crate::proof::merkle_root;
use alloy_primitives::{keccak256, B256, U256};

/// `keccak(number_be || hash || td_be)`
pub fn cht_leaf(number: u64, hash: B256, td: U256) -> B256 {
    let mut buf = [0u8; 8 + 32 + 32];
    buf[..8].copy_from_slice(&number.to_be_bytes());
    buf[8..40].copy_from_slice(hash.as_slice());
    buf[40..].copy_from_slice(&td.to_be_bytes::<32>());
    keccak256(buf)
}

#[derive(Debug, Default)]
pub struct ChtIndexer {
    leaves: Vec<B256>,
}

impl IndexerBackend for ChtIndexer {
    const NAME: &'static str = "cht";

    fn reset(&mut self, _section: u64) {
        self.leaves.clear();
    }

    fn process(&mut self, header: &Header, hash: B256, td: U256) {
        self.leaves.push(cht_leaf(header.number, hash, td));
    }

    fn commit(&mut self) -> B256 {
        merkle_root(&self.leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_binds_td() {
        let hash = B256::repeat_byte(1);
        assert_ne!(
            cht_leaf(7, hash, U256::from(10)),
            cht_leaf(7, hash, U256::from(11))
        );
        assert_ne!(
            cht_leaf(7, hash, U256::from(10)),
            cht_leaf(8, hash, U256::from(10))
        );
    }
}
