//! Primitive type aliases shared across the workspace.

use alloy_primitives::FixedBytes;

pub use alloy_primitives::{Address, Bytes, B256, I256, U256};

/// Hash of a DAG block.
pub type BlockHash = B256;
/// Hash of a transaction.
pub type TrxHash = B256;
/// Hash of a PBFT vote.
pub type VoteHash = B256;
/// Hash of a PBFT block.
pub type PbftHash = B256;
/// Hash of a pillar block (ABI-packed encoding).
pub type PillarHash = B256;
/// Identity of a network peer.
pub type NodeId = B256;

/// DAG block level (distance from genesis along the deepest parent).
pub type Level = u64;
/// PBFT period: one finalized anchor per period.
pub type PbftPeriod = u64;
/// PBFT round within a period.
pub type PbftRound = u64;
/// PBFT step within a round (1 = propose, 2 = soft, 3 = cert, 4 = push, 5.. = next).
pub type PbftStep = u32;

/// Recoverable secp256k1 signature on the wire (`r || s || v`).
pub type Signature65 = FixedBytes<65>;
/// Compressed BLS signature on the wire.
pub type BlsSigBytes = FixedBytes<96>;
/// Compressed BLS public key on the wire.
pub type BlsPkBytes = FixedBytes<48>;

/// The null block hash: genesis parent, null-anchor marker, NULL vote value.
pub const NULL_BLOCK_HASH: B256 = B256::ZERO;

/// Convert a wire signature into the crypto layer's representation.
pub fn recoverable(sig: &Signature65) -> shared_crypto::ecdsa::RecoverableSignature {
    shared_crypto::ecdsa::RecoverableSignature::from_bytes(sig.0)
}

/// Convert a crypto-layer signature into its wire form.
pub fn signature_bytes(sig: &shared_crypto::ecdsa::RecoverableSignature) -> Signature65 {
    FixedBytes(*sig.as_bytes())
}
