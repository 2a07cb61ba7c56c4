//! Keccak-256 helpers.
//!
//! All protocol hashes (transaction, DAG block, vote, PBFT block, pillar
//! block) are keccak-256 over an RLP encoding produced by the caller.

use alloy_primitives::B256;
use sha3::{Digest, Keccak256};

/// Hash arbitrary bytes with keccak-256.
pub fn keccak256(data: impl AsRef<[u8]>) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    B256::from_slice(&hasher.finalize())
}

/// Hash the concatenation of two byte strings.
pub fn keccak256_pair(a: impl AsRef<[u8]>, b: impl AsRef<[u8]>) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(a.as_ref());
    hasher.update(b.as_ref());
    B256::from_slice(&hasher.finalize())
}
