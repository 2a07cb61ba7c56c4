//! # Recoverable ECDSA Signatures (secp256k1)
//!
//! Production ECDSA signatures using the secp256k1 curve.
//!
//! ## Security Properties
//!
//! - RFC 6979 deterministic nonces (no RNG dependency for signing)
//! - Recoverable signatures: the signer address is derived from the
//!   signature itself, so transactions and votes carry no public key
//!
//! ## Use Cases
//!
//! - Transaction signing (sender recovery)
//! - DAG block and PBFT block proposer signatures
//! - PBFT vote signatures

use crate::{hashing::keccak256, CryptoError};
use alloy_primitives::{Address, B256};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use zeroize::Zeroize;

/// A 65-byte recoverable signature: `r || s || v` with `v ∈ {0, 1}`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature(pub [u8; 65]);

impl RecoverableSignature {
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    fn split(&self) -> Result<(Signature, RecoveryId), CryptoError> {
        let sig = Signature::from_slice(&self.0[..64]).map_err(|_| CryptoError::InvalidSignature)?;
        let recid = RecoveryId::from_byte(self.0[64]).ok_or(CryptoError::InvalidSignature)?;
        Ok((sig, recid))
    }
}

impl std::fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoverableSignature(0x{})", alloy_primitives::hex::encode(self.0))
    }
}

impl Default for RecoverableSignature {
    fn default() -> Self {
        Self([0u8; 65])
    }
}

/// secp256k1 keypair used for node identity and artifact signing.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Create from secret key bytes (32 bytes).
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_bytes(bytes.into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// The address derived from this key (keccak of the uncompressed point).
    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte message hash, producing a recoverable signature.
    pub fn sign_hash(&self, msg_hash: &B256) -> Result<RecoverableSignature, CryptoError> {
        let (sig, recid) = self
            .signing_key
            .sign_prehash_recoverable(msg_hash.as_slice())
            .map_err(|_| CryptoError::InvalidSignature)?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        Ok(RecoverableSignature(out))
    }

    /// Get secret key bytes (for wallet persistence).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        let mut bytes: [u8; 32] = self.signing_key.to_bytes().into();
        bytes.zeroize();
    }
}

/// Recover the signer address from a message hash and recoverable signature.
pub fn recover_signer(
    msg_hash: &B256,
    signature: &RecoverableSignature,
) -> Result<Address, CryptoError> {
    let (sig, recid) = signature.split()?;
    let key = VerifyingKey::recover_from_prehash(msg_hash.as_slice(), &sig, recid)
        .map_err(|_| CryptoError::SignatureVerificationFailed)?;
    Ok(address_of(&key))
}

/// Verify that `signature` over `msg_hash` recovers to `expected`.
pub fn verify_signer(
    msg_hash: &B256,
    signature: &RecoverableSignature,
    expected: &Address,
) -> Result<(), CryptoError> {
    let recovered = recover_signer(msg_hash, signature)?;
    if recovered != *expected {
        return Err(CryptoError::SignatureVerificationFailed);
    }
    Ok(())
}

fn address_of(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    // Skip the 0x04 SEC1 tag, hash the 64-byte coordinates, keep low 20 bytes.
    let digest = keccak256(&encoded.as_bytes()[1..]);
    Address::from_slice(&digest[12..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_recover_roundtrip() {
        let keypair = KeyPair::generate();
        let msg = keccak256(b"block payload");

        let sig = keypair.sign_hash(&msg).unwrap();
        let recovered = recover_signer(&msg, &sig).unwrap();

        assert_eq!(recovered, keypair.address());
    }

    #[test]
    fn test_wrong_message_recovers_other_address() {
        let keypair = KeyPair::generate();
        let sig = keypair.sign_hash(&keccak256(b"message1")).unwrap();

        let recovered = recover_signer(&keccak256(b"message2"), &sig);
        // Either recovery fails or yields a different address.
        match recovered {
            Ok(addr) => assert_ne!(addr, keypair.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_deterministic_signatures() {
        let keypair = KeyPair::from_secret_bytes(&[0xAB; 32]).unwrap();
        let msg = keccak256(b"deterministic");

        let sig1 = keypair.sign_hash(&msg).unwrap();
        let sig2 = keypair.sign_hash(&msg).unwrap();

        assert_eq!(sig1.as_bytes(), sig2.as_bytes());
    }

    #[test]
    fn test_verify_signer_rejects_impostor() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let msg = keccak256(b"payload");

        let sig = keypair.sign_hash(&msg).unwrap();
        assert!(verify_signer(&msg, &sig, &keypair.address()).is_ok());
        assert!(verify_signer(&msg, &sig, &other.address()).is_err());
    }

    #[test]
    fn test_keypair_from_secret_roundtrip() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&original.secret_bytes()).unwrap();
        assert_eq!(original.address(), restored.address());
    }
}
