//! Bloom-bit rotation and the two indexers built on it.
//!
//! Header blooms are rotated into one bit vector per bloom bit: vector `i`
//! has bit `j` set when block `j` of the section has bloom bit `i` set. The
//! bloom indexer stores these vectors for local filtering; the bloom trie
//! indexer commits to them so remote vectors can be verified.

use super::IndexerBackend;
use crate::chain::Header;
use crate::proof::merkle_root;
use alloy_primitives::{keccak256, Bloom, B256, U256};

pub const BLOOM_BIT_LENGTH: usize = 2048;
const BLOOM_BYTE_LENGTH: usize = BLOOM_BIT_LENGTH / 8;

pub fn bloom_bits_key(bit: u16, section: u64) -> String {
    format!("bloombits/{bit}/{section}")
}

/// `keccak(bit_be || vector)`
pub fn bloom_trie_leaf(bit: u16, vector: &[u8]) -> B256 {
    let mut buf = Vec::with_capacity(2 + vector.len());
    buf.extend_from_slice(&bit.to_be_bytes());
    buf.extend_from_slice(vector);
    keccak256(buf)
}

#[derive(Debug, Clone)]
pub struct BloomBitsGenerator {
    section_size: u64,
    vectors: Vec<Vec<u8>>,
    next: u64,
}

impl BloomBitsGenerator {
    pub fn new(section_size: u64) -> Self {
        let len = section_size.div_ceil(8) as usize;
        Self {
            section_size,
            vectors: vec![vec![0u8; len]; BLOOM_BIT_LENGTH],
            next: 0,
        }
    }

    pub fn reset(&mut self) {
        for vector in &mut self.vectors {
            vector.fill(0);
        }
        self.next = 0;
    }

    /// Add the bloom of the next block in the section. Extra blooms are ignored.
    pub fn add_bloom(&mut self, bloom: &Bloom) {
        if self.next >= self.section_size {
            return;
        }
        let byte_index = (self.next / 8) as usize;
        let mask = 1u8 << (7 - self.next % 8);
        for bit in 0..BLOOM_BIT_LENGTH {
            let bloom_byte = bloom[BLOOM_BYTE_LENGTH - 1 - bit / 8];
            if bloom_byte & (1u8 << (bit % 8)) != 0 {
                self.vectors[bit][byte_index] |= mask;
            }
        }
        self.next += 1;
    }

    pub fn vector(&self, bit: u16) -> &[u8] {
        &self.vectors[bit as usize]
    }

    pub fn vectors(&self) -> &[Vec<u8>] {
        &self.vectors
    }

    pub fn trie_leaves(&self) -> Vec<B256> {
        self.vectors
            .iter()
            .enumerate()
            .map(|(bit, vector)| bloom_trie_leaf(bit as u16, vector))
            .collect()
    }
}

/// Stores rotated bloom bits; the section root is the section head hash.
#[derive(Debug)]
pub struct BloomIndexer {
    bits: BloomBitsGenerator,
    head: B256,
}

impl BloomIndexer {
    pub fn new(section_size: u64) -> Self {
        Self {
            bits: BloomBitsGenerator::new(section_size),
            head: B256::ZERO,
        }
    }
}

impl IndexerBackend for BloomIndexer {
    const NAME: &'static str = "bloombits";

    fn reset(&mut self, _section: u64) {
        self.bits.reset();
        self.head = B256::ZERO;
    }

    fn process(&mut self, header: &Header, hash: B256, _td: U256) {
        self.bits.add_bloom(&header.logs_bloom);
        self.head = hash;
    }

    fn commit(&mut self) -> B256 {
        self.head
    }

    fn artifacts(&self, section: u64) -> Vec<(String, Vec<u8>)> {
        self.bits
            .vectors()
            .iter()
            .enumerate()
            .map(|(bit, vector)| (bloom_bits_key(bit as u16, section), vector.to_vec()))
            .collect()
    }
}

/// Commits to the 2048 rotated vectors of a section.
#[derive(Debug)]
pub struct BloomTrieIndexer {
    bits: BloomBitsGenerator,
}

impl BloomTrieIndexer {
    pub fn new(section_size: u64) -> Self {
        Self {
            bits: BloomBitsGenerator::new(section_size),
        }
    }
}

impl IndexerBackend for BloomTrieIndexer {
    const NAME: &'static str = "bloomtrie";

    fn reset(&mut self, _section: u64) {
        self.bits.reset();
    }

    fn process(&mut self, header: &Header, _hash: B256, _td: U256) {
        self.bits.add_bloom(&header.logs_bloom);
    }

    fn commit(&mut self) -> B256 {
        merkle_root(&self.bits.trie_leaves())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::BloomInput;

    #[test]
    fn rotation_places_block_bits() {
        let mut bloom = Bloom::ZERO;
        bloom.accrue(BloomInput::Raw(b"transfer"));
        let set_bits: Vec<usize> = (0..BLOOM_BIT_LENGTH)
            .filter(|bit| bloom[BLOOM_BYTE_LENGTH - 1 - bit / 8] & (1 << (bit % 8)) != 0)
            .collect();
        assert!(!set_bits.is_empty() && set_bits.len() <= 3);

        let mut generator = BloomBitsGenerator::new(16);
        generator.add_bloom(&Bloom::ZERO);
        generator.add_bloom(&bloom);
        for bit in 0..BLOOM_BIT_LENGTH {
            let expected = if set_bits.contains(&bit) {
                vec![0b0100_0000, 0]
            } else {
                vec![0, 0]
            };
            assert_eq!(generator.vector(bit as u16), expected.as_slice(), "bit {bit}");
        }

        generator.reset();
        assert!(generator.vectors().iter().all(|v| v.iter().all(|b| *b == 0)));
    }
}
