//! Pillar chain entities.
//!
//! A pillar block is an epoch checkpoint consumed by external bridges. Its
//! hash is keccak over a contract-ABI packed encoding (32-byte big-endian
//! fields) so a Solidity verifier can recompute it; the RLP encoding is
//! only used for gossip and persistence.

use crate::{primitives::*, EntityError};
use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use shared_crypto::bls::{PillarBlsKeys, PillarBlsPublicKey, PillarBlsSignature};
use shared_crypto::hashing::keccak256;
use std::sync::OnceLock;

/// Delta of one validator's stake between two consecutive pillar blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorStakeChange {
    pub validator: Address,
    /// Signed delta; negative on undelegation.
    pub stake_change: I256,
}

impl ValidatorStakeChange {
    pub fn new(validator: Address, stake_change: I256) -> Self {
        Self {
            validator,
            stake_change,
        }
    }

    fn payload_length(&self) -> usize {
        // Address plus the 32-byte two's-complement delta.
        self.validator.length() + 33
    }
}

impl Encodable for ValidatorStakeChange {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.payload_length();
        Header { list: true, payload_length }.encode(out);
        self.validator.encode(out);
        B256::from(self.stake_change.to_be_bytes::<32>()).encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for ValidatorStakeChange {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let validator = Address::decode(buf)?;
        let raw = B256::decode(buf)?;
        Ok(Self {
            validator,
            stake_change: I256::from_be_bytes(raw.0),
        })
    }
}

/// Epoch checkpoint carrying the finalized state root and validator stake
/// deltas since the previous pillar block.
#[derive(Debug, Clone)]
pub struct PillarBlock {
    period: PbftPeriod,
    state_root: B256,
    bridge_root: B256,
    epoch: u64,
    previous_pillar_block_hash: PillarHash,
    validators_stakes_changes: Vec<ValidatorStakeChange>,

    cached_hash: OnceLock<PillarHash>,
}

impl PillarBlock {
    pub fn new(
        period: PbftPeriod,
        state_root: B256,
        bridge_root: B256,
        epoch: u64,
        previous_pillar_block_hash: PillarHash,
        validators_stakes_changes: Vec<ValidatorStakeChange>,
    ) -> Self {
        Self {
            period,
            state_root,
            bridge_root,
            epoch,
            previous_pillar_block_hash,
            validators_stakes_changes,
            cached_hash: OnceLock::new(),
        }
    }

    pub fn period(&self) -> PbftPeriod {
        self.period
    }

    pub fn state_root(&self) -> B256 {
        self.state_root
    }

    pub fn bridge_root(&self) -> B256 {
        self.bridge_root
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn previous_pillar_block_hash(&self) -> PillarHash {
        self.previous_pillar_block_hash
    }

    pub fn validators_stakes_changes(&self) -> &[ValidatorStakeChange] {
        &self.validators_stakes_changes
    }

    /// keccak over the ABI-packed encoding, cached.
    pub fn hash(&self) -> PillarHash {
        *self.cached_hash.get_or_init(|| keccak256(self.abi_encoded()))
    }

    /// Contract-ABI layout: every field big-endian padded to 32 bytes,
    /// stake changes appended as `(address, delta)` pairs.
    pub fn abi_encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * (5 + 2 * self.validators_stakes_changes.len()));
        out.extend_from_slice(&U256::from(self.period).to_be_bytes::<32>());
        out.extend_from_slice(self.state_root.as_slice());
        out.extend_from_slice(self.bridge_root.as_slice());
        out.extend_from_slice(&U256::from(self.epoch).to_be_bytes::<32>());
        out.extend_from_slice(self.previous_pillar_block_hash.as_slice());
        for change in &self.validators_stakes_changes {
            out.extend_from_slice(&B256::left_padding_from(change.validator.as_slice()).0);
            out.extend_from_slice(&change.stake_change.to_be_bytes::<32>());
        }
        out
    }

    fn payload_length(&self) -> usize {
        self.period.length()
            + self.state_root.length()
            + self.bridge_root.length()
            + self.epoch.length()
            + self.previous_pillar_block_hash.length()
            + self.validators_stakes_changes.length()
    }
}

impl PartialEq for PillarBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for PillarBlock {}

impl Encodable for PillarBlock {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.payload_length();
        Header { list: true, payload_length }.encode(out);
        self.period.encode(out);
        self.state_root.encode(out);
        self.bridge_root.encode(out);
        self.epoch.encode(out);
        self.previous_pillar_block_hash.encode(out);
        self.validators_stakes_changes.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for PillarBlock {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            period: PbftPeriod::decode(buf)?,
            state_root: B256::decode(buf)?,
            bridge_root: B256::decode(buf)?,
            epoch: u64::decode(buf)?,
            previous_pillar_block_hash: PillarHash::decode(buf)?,
            validators_stakes_changes: Vec::<ValidatorStakeChange>::decode(buf)?,
            cached_hash: OnceLock::new(),
        })
    }
}

/// One validator's BLS signature over a pillar block hash.
#[derive(Debug, Clone)]
pub struct PillarVote {
    period: PbftPeriod,
    pillar_block_hash: PillarHash,
    signer: Address,
    bls_signature: BlsSigBytes,

    cached_hash: OnceLock<B256>,
}

impl PillarVote {
    pub fn new(
        period: PbftPeriod,
        pillar_block_hash: PillarHash,
        signer: Address,
        keys: &PillarBlsKeys,
    ) -> Self {
        let signature = keys.sign_pillar_hash(&pillar_block_hash);
        Self {
            period,
            pillar_block_hash,
            signer,
            bls_signature: BlsSigBytes::from(signature.to_bytes()),
            cached_hash: OnceLock::new(),
        }
    }

    pub fn period(&self) -> PbftPeriod {
        self.period
    }

    pub fn pillar_block_hash(&self) -> PillarHash {
        self.pillar_block_hash
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub fn bls_signature(&self) -> Result<PillarBlsSignature, EntityError> {
        PillarBlsSignature::from_bytes(&self.bls_signature.0).map_err(EntityError::from)
    }

    pub fn hash(&self) -> B256 {
        *self.cached_hash.get_or_init(|| keccak256(alloy_rlp::encode(self)))
    }

    /// Verify the BLS signature against the signer's registered key.
    pub fn verify(&self, public_key: &PillarBlsPublicKey) -> Result<(), EntityError> {
        self.bls_signature()?
            .verify_pillar_hash(&self.pillar_block_hash, public_key)
            .map_err(EntityError::from)
    }

    fn payload_length(&self) -> usize {
        self.period.length()
            + self.pillar_block_hash.length()
            + self.signer.length()
            + self.bls_signature.length()
    }
}

impl PartialEq for PillarVote {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for PillarVote {}

impl Encodable for PillarVote {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.payload_length();
        Header { list: true, payload_length }.encode(out);
        self.period.encode(out);
        self.pillar_block_hash.encode(out);
        self.signer.encode(out);
        self.bls_signature.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for PillarVote {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            period: PbftPeriod::decode(buf)?,
            pillar_block_hash: PillarHash::decode(buf)?,
            signer: Address::decode(buf)?,
            bls_signature: BlsSigBytes::decode(buf)?,
            cached_hash: OnceLock::new(),
        })
    }
}
