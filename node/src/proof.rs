//! Binary keccak Merkle trees for section commitments.
//!
//! Leaves are padded with zero hashes up to the next power of two. A proof is
//! the list of sibling hashes from the leaf level upwards; the leaf index
//! decides on which side each sibling sits.

use alloy_primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: u64,
    pub siblings: Vec<B256>,
}

fn hash_pair(left: &B256, right: &B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_slice());
    buf[32..].copy_from_slice(right.as_slice());
    keccak256(buf)
}

fn padded_level(leaves: &[B256]) -> Vec<B256> {
    let width = leaves.len().next_power_of_two();
    let mut level = leaves.to_vec();
    level.resize(width, B256::ZERO);
    level
}

fn next_level(level: &[B256]) -> Vec<B256> {
    level
        .chunks(2)
        .map(|pair| hash_pair(&pair[0], &pair[1]))
        .collect()
}

/// Root over `leaves`. An empty tree has the zero root.
pub fn merkle_root(leaves: &[B256]) -> B256 {
    if leaves.is_empty() {
        return B256::ZERO;
    }
    let mut level = padded_level(leaves);
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

pub fn merkle_proof(leaves: &[B256], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }
    let mut level = padded_level(leaves);
    let mut position = index;
    let mut siblings = Vec::new();
    while level.len() > 1 {
        siblings.push(level[position ^ 1]);
        level = next_level(&level);
        position /= 2;
    }
    Some(MerkleProof {
        index: index as u64,
        siblings,
    })
}

pub fn verify_proof(root: B256, leaf: B256, proof: &MerkleProof) -> bool {
    if proof.siblings.len() >= 64 || proof.index >> proof.siblings.len() != 0 {
        return false;
    }
    let mut node = leaf;
    let mut position = proof.index;
    for sibling in &proof.siblings {
        node = if position & 1 == 0 {
            hash_pair(&node, sibling)
        } else {
            hash_pair(sibling, &node)
        };
        position >>= 1;
    }
    node == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<B256> {
        (0..n).map(|i| keccak256([i])).collect()
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l), l[0]);
        let proof = merkle_proof(&l, 0).expect("proof");
        assert!(proof.siblings.is_empty());
        assert!(verify_proof(l[0], l[0], &proof));
    }

    #[test]
    fn proofs_verify_for_every_leaf_of_uneven_tree() {
        let l = leaves(5);
        let root = merkle_root(&l);
        for (index, leaf) in l.iter().enumerate() {
            let proof = merkle_proof(&l, index).expect("proof");
            assert_eq!(proof.siblings.len(), 3);
            assert!(verify_proof(root, *leaf, &proof), "leaf {index}");
        }
        assert!(merkle_proof(&l, 5).is_none());
    }

    #[test]
    fn proof_rejects_wrong_leaf_or_index() {
        let l = leaves(4);
        let root = merkle_root(&l);
        let mut proof = merkle_proof(&l, 2).expect("proof");
        assert!(!verify_proof(root, l[1], &proof));
        proof.index = 3;
        assert!(!verify_proof(root, l[2], &proof));
        proof.index = 6;
        assert!(!verify_proof(root, l[2], &proof));
    }
}
