//! # VRF Proofs and Stake-Weighted Sortition
//!
//! A validator proves with a VRF that it won the lottery for a given
//! `(period, round, step)` without any interaction. The proof is a
//! deterministic recoverable signature over the sortition message by the
//! validator's registered VRF key; the VRF output is the keccak of that
//! proof, uniform over `[0, 2^256)`.
//!
//! ## Sortition predicate
//!
//! A voter with `vote_count` eligible votes out of `total_count` wins when
//!
//! ```text
//! output / 2^256  <  vote_count / total_count · committee_size
//! ```
//!
//! evaluated by 512-bit cross multiplication so no division is needed:
//! `output · total_count < 2^256 · vote_count · committee_size`.

use crate::{
    ecdsa::{KeyPair, RecoverableSignature},
    hashing::keccak256,
    CryptoError,
};
use alloy_primitives::{B256, U512};

/// A VRF keypair. Distinct from the node's wallet key; registered on-chain
/// through the DPoS contract.
pub struct VrfKeyPair {
    inner: KeyPair,
}

/// Compressed VRF public key commitment: the address form of the VRF key.
pub type VrfPublicKey = alloy_primitives::Address;

/// A VRF proof with its derived uniform output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrfProof {
    pub proof: RecoverableSignature,
}

impl VrfKeyPair {
    pub fn generate() -> Self {
        Self {
            inner: KeyPair::generate(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner: KeyPair::from_secret_bytes(bytes)?,
        })
    }

    /// The public commitment registered on-chain.
    pub fn public_key(&self) -> VrfPublicKey {
        self.inner.address()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.inner.secret_bytes()
    }

    /// Produce a proof over `message`. Deterministic: RFC 6979 nonces make
    /// the proof, and therefore the output, a pure function of the key and
    /// message.
    pub fn prove(&self, message: &[u8]) -> Result<VrfProof, CryptoError> {
        let proof = self.inner.sign_hash(&keccak256(message))?;
        Ok(VrfProof { proof })
    }
}

impl VrfProof {
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self {
            proof: RecoverableSignature::from_bytes(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        self.proof.as_bytes()
    }

    /// The uniform output this proof maps to.
    pub fn output(&self) -> B256 {
        keccak256(self.proof.as_bytes())
    }

    /// Verify the proof against a registered VRF key and return the output.
    pub fn verify(&self, public_key: &VrfPublicKey, message: &[u8]) -> Result<B256, CryptoError> {
        let recovered = crate::ecdsa::recover_signer(&keccak256(message), &self.proof)
            .map_err(|_| CryptoError::InvalidVrfProof)?;
        if recovered != *public_key {
            return Err(CryptoError::InvalidVrfProof);
        }
        Ok(self.output())
    }
}

/// Stake-weighted sortition over a VRF output.
///
/// Returns true when the output falls under the voter's threshold share of
/// the committee.
pub fn sortition(output: &B256, vote_count: u64, total_count: u64, committee_size: u64) -> bool {
    if vote_count == 0 || total_count == 0 {
        return false;
    }
    // Everyone is always in a committee at least as large as the whole set.
    if committee_size >= total_count {
        return true;
    }

    let lhs = U512::from_be_slice(output.as_slice()) * U512::from(total_count);
    let rhs = (U512::from(1u8) << 256) * U512::from(vote_count) * U512::from(committee_size);
    lhs < rhs
}
