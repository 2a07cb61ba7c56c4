//! # Shared Cryptographic Primitives
//!
//! Opaque wrappers around the curve and hash libraries used by the node:
//!
//! - `hashing`: keccak-256 helpers
//! - `ecdsa`: recoverable secp256k1 signatures (sender recovery)
//! - `vrf`: verifiable random function proofs and the stake-weighted
//!   sortition predicate
//! - `vdf`: verifiable delay function gating DAG block emission
//! - `bls`: pillar-vote signing, verification and certificate aggregation
//!
//! The rest of the workspace treats these modules as black boxes; no other
//! crate talks to `k256` or `blst` directly.

pub mod bls;
pub mod ecdsa;
pub mod hashing;
pub mod vdf;
pub mod vrf;

use thiserror::Error;

/// Errors produced by the cryptographic wrappers.
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    /// Private key bytes do not form a valid scalar.
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Public key bytes do not form a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature bytes are malformed.
    #[error("invalid signature")]
    InvalidSignature,

    /// Signature does not verify against the given key and message.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// BLS aggregation over an empty or inconsistent input set.
    #[error("signature aggregation failed")]
    AggregationFailed,

    /// VRF proof failed verification.
    #[error("invalid vrf proof")]
    InvalidVrfProof,

    /// VDF solution failed verification.
    #[error("invalid vdf solution: {0}")]
    InvalidVdf(String),
}
