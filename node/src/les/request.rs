//! Retrievable request kinds.
//!
//! Each kind decides which peers may serve it, which protocol message to
//! send, and how to authenticate the answer against locally trusted roots.

use super::peers::Peer;
use super::LPV2;
use crate::chain::{receipts_root, Header, Receipt};
use crate::indexer::{bloom_trie_leaf, cht_leaf, SectionConfig};
use crate::proof::{verify_proof, MerkleProof};
use alloy_primitives::{Bytes, B256, U256};
use alloy_rlp::Encodable;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolRequest {
    HeaderProof { section: u64, number: u64 },
    Receipts { hash: B256 },
    BloomBits { section: u64, bit: u16 },
}

impl ProtocolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeaderProof { .. } => "header_proof",
            Self::Receipts { .. } => "receipts",
            Self::BloomBits { .. } => "bloom_bits",
        }
    }

    /// Approximate encoded size, for traffic accounting.
    pub fn wire_size(&self) -> usize {
        1 + match self {
            Self::HeaderProof { section, number } => section.length() + number.length(),
            Self::Receipts { hash } => hash.length(),
            Self::BloomBits { section, bit } => section.length() + bit.length(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolResponse {
    HeaderProof {
        header: Header,
        td: U256,
        proof: MerkleProof,
    },
    Receipts(Vec<Receipt>),
    BloomBits {
        vector: Bytes,
        proof: MerkleProof,
    },
}

impl ProtocolResponse {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeaderProof { .. } => "header_proof",
            Self::Receipts(_) => "receipts",
            Self::BloomBits { .. } => "bloom_bits",
        }
    }

    pub fn wire_size(&self) -> usize {
        let proof_size = |proof: &MerkleProof| proof.index.length() + proof.siblings.len() * 33;
        1 + match self {
            Self::HeaderProof { header, td, proof } => {
                header.length() + td.length() + proof_size(proof)
            }
            Self::Receipts(receipts) => receipts.length(),
            Self::BloomBits { vector, proof } => vector.length() + proof_size(proof),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("expected {expected} response, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
    #[error("header number {got}, requested {expected}")]
    NumberMismatch { expected: u64, got: u64 },
    #[error("proof index {got}, expected {expected}")]
    IndexMismatch { expected: u64, got: u64 },
    #[error("proof does not match the trusted section root")]
    ProofMismatch,
    #[error("receipts do not match the header receipts root")]
    ReceiptsRootMismatch,
    #[error("bloom vector length {got}, expected {expected}")]
    VectorLength { expected: usize, got: usize },
}

/// A request the retrieve manager can distribute, send and verify.
pub trait OdrRequest: Send + Sync + 'static {
    type Output: Send + 'static;

    fn can_send(&self, peer: &Peer) -> bool;
    fn message(&self) -> ProtocolRequest;
    fn validate(&self, response: ProtocolResponse) -> Result<Self::Output, ValidationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWithTd {
    pub header: Header,
    pub td: U256,
}

/// Header by number, proven against a confirmed CHT root.
#[derive(Debug, Clone)]
pub struct HeaderRequest {
    pub number: u64,
    pub cht: SectionConfig,
    pub cht_root: B256,
}

impl HeaderRequest {
    fn section(&self) -> u64 {
        self.cht.section_of(self.number)
    }
}

impl OdrRequest for HeaderRequest {
    type Output = HeaderWithTd;

    fn can_send(&self, peer: &Peer) -> bool {
        peer.head().number >= self.cht.section_end(self.section())
    }

    fn message(&self) -> ProtocolRequest {
        ProtocolRequest::HeaderProof {
            section: self.section(),
            number: self.number,
        }
    }

    fn validate(&self, response: ProtocolResponse) -> Result<Self::Output, ValidationError> {
        let got = response.name();
        let ProtocolResponse::HeaderProof { header, td, proof } = response else {
            return Err(ValidationError::UnexpectedResponse {
                expected: "header_proof",
                got,
            });
        };
        if header.number != self.number {
            return Err(ValidationError::NumberMismatch {
                expected: self.number,
                got: header.number,
            });
        }
        let index = self.number - self.section() * self.cht.size;
        if proof.index != index {
            return Err(ValidationError::IndexMismatch {
                expected: index,
                got: proof.index,
            });
        }
        let leaf = cht_leaf(header.number, header.hash_slow(), td);
        if !verify_proof(self.cht_root, leaf, &proof) {
            return Err(ValidationError::ProofMismatch);
        }
        Ok(HeaderWithTd { header, td })
    }
}

/// Receipts of a known header.
#[derive(Debug, Clone)]
pub struct ReceiptsRequest {
    pub number: u64,
    pub hash: B256,
    pub receipts_root: B256,
}

impl OdrRequest for ReceiptsRequest {
    type Output = Vec<Receipt>;

    fn can_send(&self, peer: &Peer) -> bool {
        peer.head().number >= self.number
    }

    fn message(&self) -> ProtocolRequest {
        ProtocolRequest::Receipts { hash: self.hash }
    }

    fn validate(&self, response: ProtocolResponse) -> Result<Self::Output, ValidationError> {
        let got = response.name();
        let ProtocolResponse::Receipts(receipts) = response else {
            return Err(ValidationError::UnexpectedResponse {
                expected: "receipts",
                got,
            });
        };
        if receipts_root(&receipts) != self.receipts_root {
            return Err(ValidationError::ReceiptsRootMismatch);
        }
        Ok(receipts)
    }
}

/// One rotated bloom-bit vector, proven against a BloomTrie root.
#[derive(Debug, Clone)]
pub struct BloomBitsRequest {
    pub bit: u16,
    pub section: u64,
    pub bloom: SectionConfig,
    pub root: B256,
}

impl OdrRequest for BloomBitsRequest {
    type Output = Bytes;

    fn can_send(&self, peer: &Peer) -> bool {
        peer.version >= LPV2 && peer.head().number >= self.bloom.section_end(self.section)
    }

    fn message(&self) -> ProtocolRequest {
        ProtocolRequest::BloomBits {
            section: self.section,
            bit: self.bit,
        }
    }

    fn validate(&self, response: ProtocolResponse) -> Result<Self::Output, ValidationError> {
        let got = response.name();
        let ProtocolResponse::BloomBits { vector, proof } = response else {
            return Err(ValidationError::UnexpectedResponse {
                expected: "bloom_bits",
                got,
            });
        };
        let expected_len = self.bloom.size.div_ceil(8) as usize;
        if vector.len() != expected_len {
            return Err(ValidationError::VectorLength {
                expected: expected_len,
                got: vector.len(),
            });
        }
        if proof.index != u64::from(self.bit) {
            return Err(ValidationError::IndexMismatch {
                expected: u64::from(self.bit),
                got: proof.index,
            });
        }
        if !verify_proof(self.root, bloom_trie_leaf(self.bit, &vector), &proof) {
            return Err(ValidationError::ProofMismatch);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::les::LPV1;
    use crate::test_utils::{sim_chain, test_peer_with, BLOOM_TEST, CHT_TEST};

    #[test]
    fn header_request_accepts_honest_and_rejects_tampered_proof() {
        let data = sim_chain(32, 7);
        let request = HeaderRequest {
            number: 11,
            cht: CHT_TEST,
            cht_root: data.cht_root(1),
        };
        assert_eq!(
            request.message(),
            ProtocolRequest::HeaderProof {
                section: 1,
                number: 11
            }
        );

        let honest = data.serve(&request.message()).expect("served");
        let verified = request.validate(honest.clone()).expect("valid");
        assert_eq!(verified.header, data.header(11).clone());

        let ProtocolResponse::HeaderProof { header, mut td, proof } = honest else {
            unreachable!();
        };
        td += U256::from(1);
        assert_eq!(
            request.validate(ProtocolResponse::HeaderProof {
                header,
                td,
                proof
            }),
            Err(ValidationError::ProofMismatch)
        );
        assert!(matches!(
            request.validate(ProtocolResponse::Receipts(Vec::new())),
            Err(ValidationError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn header_request_needs_peer_past_section() {
        let request = HeaderRequest {
            number: 11,
            cht: CHT_TEST,
            cht_root: B256::ZERO,
        };
        assert!(!request.can_send(&test_peer_with(1, 1, 14, LPV1)));
        assert!(request.can_send(&test_peer_with(1, 1, 15, LPV1)));
    }

    #[test]
    fn receipts_request_checks_root() {
        let data = sim_chain(8, 3);
        let header = data.header(5).clone();
        let request = ReceiptsRequest {
            number: 5,
            hash: header.hash_slow(),
            receipts_root: header.receipts_root,
        };
        let response = data.serve(&request.message()).expect("served");
        assert_eq!(request.validate(response).expect("valid"), data.receipts(5));

        let mut forged = data.receipts(5);
        forged.push(Receipt {
            success: false,
            cumulative_gas_used: 1,
            logs_bloom: Default::default(),
            logs: Vec::new(),
        });
        assert_eq!(
            request.validate(ProtocolResponse::Receipts(forged)),
            Err(ValidationError::ReceiptsRootMismatch)
        );
    }

    #[test]
    fn bloom_bits_request_requires_lpv2_and_valid_proof() {
        let data = sim_chain(32, 11);
        let request = BloomBitsRequest {
            bit: 77,
            section: 0,
            bloom: BLOOM_TEST,
            root: data.bloom_trie_root(0),
        };
        assert!(!request.can_send(&test_peer_with(1, 1, 100, LPV1)));
        assert!(request.can_send(&test_peer_with(1, 1, 100, LPV2)));

        let response = data.serve(&request.message()).expect("served");
        let vector = request.validate(response.clone()).expect("valid");
        assert_eq!(vector.len(), (BLOOM_TEST.size / 8) as usize);

        let ProtocolResponse::BloomBits { proof, .. } = response else {
            unreachable!();
        };
        let mut flipped = vector.to_vec();
        flipped[0] ^= 1;
        assert_eq!(
            request.validate(ProtocolResponse::BloomBits {
                vector: flipped.into(),
                proof
            }),
            Err(ValidationError::ProofMismatch)
        );
    }
}
