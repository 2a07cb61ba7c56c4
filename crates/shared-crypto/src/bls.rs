//! BLS certification of pillar blocks.
//!
//! The only BLS consumer in the protocol is the pillar chain: validators
//! sign pillar block hashes, and 2t+1 of those signatures fold into one
//! certificate an external bridge checks with a single pairing. The
//! surface here is deliberately that narrow — sign one pillar hash,
//! verify one vote, assemble one certificate — not a general signing
//! facility.
//!
//! Signatures cover a domain-prefixed message, so a pillar key can never
//! be coaxed into signing any other artifact class. Min-pk BLS12-381:
//! 48-byte public keys, 96-byte signatures.

use alloy_primitives::B256;
use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::RngCore;

use crate::CryptoError;

/// Ciphersuite tag for the hash-to-curve step.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Prefix separating pillar votes from every other signable payload.
const PILLAR_VOTE_DOMAIN: &[u8] = b"helix/pillar-vote/v1";

/// The exact byte string a pillar vote signs.
fn signing_message(pillar_hash: &B256) -> Vec<u8> {
    let mut message = Vec::with_capacity(PILLAR_VOTE_DOMAIN.len() + 32);
    message.extend_from_slice(PILLAR_VOTE_DOMAIN);
    message.extend_from_slice(pillar_hash.as_slice());
    message
}

/// A validator's pillar-vote keypair. Held next to the wallet key but
/// registered separately through the DPoS contract.
pub struct PillarBlsKeys {
    secret: SecretKey,
    public: PillarBlsPublicKey,
}

impl PillarBlsKeys {
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        let secret = SecretKey::key_gen(&ikm, &[]).expect("valid IKM");
        let public = PillarBlsPublicKey(secret.sk_to_pk());
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let public = PillarBlsPublicKey(secret.sk_to_pk());
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PillarBlsPublicKey {
        self.public.clone()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Vote for a pillar block.
    pub fn sign_pillar_hash(&self, pillar_hash: &B256) -> PillarBlsSignature {
        PillarBlsSignature(self.secret.sign(&signing_message(pillar_hash), DST, &[]))
    }
}

/// Registered pillar-vote verification key (48 bytes compressed).
#[derive(Clone, Debug)]
pub struct PillarBlsPublicKey(PublicKey);

impl PillarBlsPublicKey {
    pub fn from_bytes(bytes: &[u8; 48]) -> Result<Self, CryptoError> {
        PublicKey::from_bytes(bytes)
            .map(PillarBlsPublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_bytes()
    }
}

impl PartialEq for PillarBlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PillarBlsPublicKey {}

/// One validator's signature over a pillar block hash (96 bytes
/// compressed).
#[derive(Clone, Debug)]
pub struct PillarBlsSignature(Signature);

impl PillarBlsSignature {
    pub fn from_bytes(bytes: &[u8; 96]) -> Result<Self, CryptoError> {
        Signature::from_bytes(bytes)
            .map(PillarBlsSignature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_bytes()
    }

    /// Check this vote against the signer's registered key.
    pub fn verify_pillar_hash(
        &self,
        pillar_hash: &B256,
        key: &PillarBlsPublicKey,
    ) -> Result<(), CryptoError> {
        match self
            .0
            .verify(true, &signing_message(pillar_hash), DST, &[], &key.0, true)
        {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(CryptoError::SignatureVerificationFailed),
        }
    }
}

impl PartialEq for PillarBlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PillarBlsSignature {}

/// A 2t+1 pillar certificate: the aggregate of the contributing
/// signatures paired with the aggregate of their keys. This is what an
/// external bridge consumes instead of the individual votes.
#[derive(Clone, Debug)]
pub struct PillarCertificate {
    signature: Signature,
    aggregate_key: PublicKey,
    signer_count: usize,
}

impl PillarCertificate {
    pub fn signer_count(&self) -> usize {
        self.signer_count
    }

    pub fn signature_bytes(&self) -> [u8; 96] {
        self.signature.to_bytes()
    }

    pub fn aggregate_key_bytes(&self) -> [u8; 48] {
        self.aggregate_key.to_bytes()
    }

    /// One-pairing check of the whole certificate.
    pub fn verify(&self, pillar_hash: &B256) -> Result<(), CryptoError> {
        match self.signature.verify(
            true,
            &signing_message(pillar_hash),
            DST,
            &[],
            &self.aggregate_key,
            true,
        ) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(CryptoError::SignatureVerificationFailed),
        }
    }
}

/// Assemble the certificate for a pillar block from `(key, vote)` pairs.
///
/// Every pair is re-verified before it contributes, so one forged or
/// misattributed vote fails the assembly instead of poisoning the
/// aggregate.
pub fn aggregate_pillar_certificate(
    pillar_hash: &B256,
    votes: &[(PillarBlsPublicKey, PillarBlsSignature)],
) -> Result<PillarCertificate, CryptoError> {
    if votes.is_empty() {
        return Err(CryptoError::AggregationFailed);
    }
    for (key, signature) in votes {
        signature.verify_pillar_hash(pillar_hash, key)?;
    }

    let signature_refs: Vec<&Signature> = votes.iter().map(|(_, s)| &s.0).collect();
    let key_refs: Vec<&PublicKey> = votes.iter().map(|(k, _)| &k.0).collect();
    let signature = AggregateSignature::aggregate(&signature_refs, true)
        .map_err(|_| CryptoError::AggregationFailed)?
        .to_signature();
    let aggregate_key = AggregatePublicKey::aggregate(&key_refs, true)
        .map_err(|_| CryptoError::AggregationFailed)?
        .to_public_key();

    Ok(PillarCertificate {
        signature,
        aggregate_key,
        signer_count: votes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pillar_hash(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    #[test]
    fn test_vote_verifies_against_signer_key() {
        let keys = PillarBlsKeys::generate();
        let vote = keys.sign_pillar_hash(&pillar_hash(0x11));
        vote.verify_pillar_hash(&pillar_hash(0x11), &keys.public_key())
            .unwrap();
    }

    #[test]
    fn test_vote_bound_to_one_pillar_hash() {
        let keys = PillarBlsKeys::generate();
        let vote = keys.sign_pillar_hash(&pillar_hash(0x11));
        assert!(vote
            .verify_pillar_hash(&pillar_hash(0x22), &keys.public_key())
            .is_err());
    }

    #[test]
    fn test_vote_rejected_under_wrong_key() {
        let signer = PillarBlsKeys::generate();
        let other = PillarBlsKeys::generate();
        let vote = signer.sign_pillar_hash(&pillar_hash(0x11));
        assert!(vote
            .verify_pillar_hash(&pillar_hash(0x11), &other.public_key())
            .is_err());
    }

    #[test]
    fn test_wire_roundtrip() {
        let keys = PillarBlsKeys::generate();
        let vote = keys.sign_pillar_hash(&pillar_hash(0x33));

        let key = PillarBlsPublicKey::from_bytes(&keys.public_key().to_bytes()).unwrap();
        let restored = PillarBlsSignature::from_bytes(&vote.to_bytes()).unwrap();
        assert_eq!(restored, vote);
        restored.verify_pillar_hash(&pillar_hash(0x33), &key).unwrap();
    }

    #[test]
    fn test_keys_restore_from_secret() {
        let keys = PillarBlsKeys::generate();
        let restored = PillarBlsKeys::from_secret_bytes(&keys.secret_bytes()).unwrap();
        assert_eq!(keys.public_key(), restored.public_key());
        assert_eq!(
            keys.sign_pillar_hash(&pillar_hash(0x01)),
            restored.sign_pillar_hash(&pillar_hash(0x01))
        );
    }

    #[test]
    fn test_certificate_assembles_and_verifies() {
        let hash = pillar_hash(0x44);
        let validators: Vec<PillarBlsKeys> =
            (0..3).map(|_| PillarBlsKeys::generate()).collect();
        let votes: Vec<(PillarBlsPublicKey, PillarBlsSignature)> = validators
            .iter()
            .map(|keys| (keys.public_key(), keys.sign_pillar_hash(&hash)))
            .collect();

        let certificate = aggregate_pillar_certificate(&hash, &votes).unwrap();
        assert_eq!(certificate.signer_count(), 3);
        certificate.verify(&hash).unwrap();
        assert!(certificate.verify(&pillar_hash(0x55)).is_err());
    }

    #[test]
    fn test_certificate_rejects_forged_member() {
        let hash = pillar_hash(0x44);
        let honest = PillarBlsKeys::generate();
        let forger = PillarBlsKeys::generate();
        // The forger claims the honest validator's key.
        let votes = vec![
            (honest.public_key(), honest.sign_pillar_hash(&hash)),
            (honest.public_key(), forger.sign_pillar_hash(&hash)),
        ];
        assert!(aggregate_pillar_certificate(&hash, &votes).is_err());
    }

    #[test]
    fn test_certificate_rejects_mixed_hashes() {
        let keys = PillarBlsKeys::generate();
        let votes = vec![(keys.public_key(), keys.sign_pillar_hash(&pillar_hash(0x01)))];
        assert!(aggregate_pillar_certificate(&pillar_hash(0x02), &votes).is_err());
    }

    #[test]
    fn test_empty_certificate_refused() {
        assert!(aggregate_pillar_certificate(&pillar_hash(0x01), &[]).is_err());
    }
}
