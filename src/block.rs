use sha2::{Digest, Sha256};

use crate::errors::HashError;
use crate::transaction::Transaction;

pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    // replay order matters: a later entry for the same email wins
    pub transactions: Vec<Transaction>,
    pub sequence_number: u64,
    pub proof_of_work: u64,
    pub hash: Hash,
    pub parent_hash: Hash,
}

impl Block {
    /// Block 0. Every node starts from this exact block and never mines or
    /// validates it.
    pub fn genesis() -> Block {
        Block::new_pending(0)
    }

    pub fn new_pending(sequence_number: u64) -> Block {
        Block {
            transactions: Vec::new(),
            sequence_number,
            proof_of_work: 0,
            hash: ZERO_HASH,
            parent_hash: ZERO_HASH,
        }
    }

    pub fn get_hash(&self) -> String {
        hex::encode(self.hash)
    }

    /// Recomputes the digest from the block's own fields.
    pub fn recompute_hash(&self) -> Result<Hash, HashError> {
        compute_hash(&self.parent_hash, &self.transactions, self.proof_of_work)
    }

    /// Cheap self-consistency check for blocks arriving from the network:
    /// the stored hash matches the content and carries enough work. Says
    /// nothing about the block's place in any chain.
    pub fn sanity_check(&self, difficulty: u32) -> bool {
        match self.recompute_hash() {
            Ok(hash) => hash == self.hash && meets_target(&hash, difficulty),
            Err(_) => false,
        }
    }
}

/// parent hash followed by the JSON encoding of the transactions
pub fn canonical_payload(
    parent_hash: &Hash,
    transactions: &[Transaction],
) -> Result<Vec<u8>, HashError> {
    let mut data = parent_hash.to_vec();
    let txs = serde_json::to_vec(transactions).map_err(|e| HashError::Encoding(e.to_string()))?;
    data.extend_from_slice(&txs);
    Ok(data)
}

pub fn digest_with_nonce(payload: &[u8], nonce: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

pub fn compute_hash(
    parent_hash: &Hash,
    transactions: &[Transaction],
    nonce: u64,
) -> Result<Hash, HashError> {
    let payload = canonical_payload(parent_hash, transactions)?;
    Ok(digest_with_nonce(&payload, nonce))
}

pub fn target(difficulty: u32) -> u64 {
    u64::MAX.checked_shr(difficulty).unwrap_or(0)
}

/// The first 8 bytes of the hash, read big-endian, must not exceed the target.
pub fn meets_target(hash: &Hash, difficulty: u32) -> bool {
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[0..8]);
    u64::from_be_bytes(head) <= target(difficulty)
}
