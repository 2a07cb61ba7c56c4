//! PBFT votes.
//!
//! A vote commits its author to one block hash at exact consensus
//! coordinates `(period, round, step)`. Eligibility is proven by the
//! embedded VRF proof over the sortition message; the vote's weight (the
//! voter's eligible vote count) is attached after verification.

use crate::{primitives::*, EntityError};
use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use shared_crypto::ecdsa::{self, KeyPair};
use shared_crypto::hashing::keccak256;
use shared_crypto::vrf::VrfProof;
use std::sync::OnceLock;

/// The four vote kinds of the 5-step state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VoteType {
    Propose = 1,
    Soft = 2,
    Cert = 3,
    Next = 4,
}

impl VoteType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Propose),
            2 => Some(Self::Soft),
            3 => Some(Self::Cert),
            4 => Some(Self::Next),
            _ => None,
        }
    }

    /// The step a vote of this type is cast in. Next-votes are cast in
    /// every step from 5 on; 5 is the canonical value.
    pub fn canonical_step(&self) -> PbftStep {
        match self {
            Self::Propose => 1,
            Self::Soft => 2,
            Self::Cert => 3,
            Self::Next => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vote {
    block_hash: B256,
    vote_type: VoteType,
    period: PbftPeriod,
    round: PbftRound,
    step: PbftStep,
    vrf_proof: Signature65,
    signature: Signature65,

    cached_hash: OnceLock<VoteHash>,
    cached_voter: OnceLock<Address>,
    weight: OnceLock<u64>,
}

impl Vote {
    pub fn new(
        block_hash: B256,
        vote_type: VoteType,
        period: PbftPeriod,
        round: PbftRound,
        step: PbftStep,
        vrf_proof: &VrfProof,
        keypair: &KeyPair,
    ) -> Result<Self, EntityError> {
        let mut vote = Self {
            block_hash,
            vote_type,
            period,
            round,
            step,
            vrf_proof: Signature65::from(*vrf_proof.as_bytes()),
            signature: Signature65::ZERO,
            cached_hash: OnceLock::new(),
            cached_voter: OnceLock::new(),
            weight: OnceLock::new(),
        };
        let sig = keypair.sign_hash(&vote.unsigned_hash())?;
        vote.signature = signature_bytes(&sig);
        let _ = vote.cached_voter.set(keypair.address());
        Ok(vote)
    }

    pub fn block_hash(&self) -> B256 {
        self.block_hash
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn period(&self) -> PbftPeriod {
        self.period
    }

    pub fn round(&self) -> PbftRound {
        self.round
    }

    pub fn step(&self) -> PbftStep {
        self.step
    }

    pub fn vrf_proof(&self) -> VrfProof {
        VrfProof::from_bytes(self.vrf_proof.0)
    }

    /// Whether this vote is for the null block (skip value).
    pub fn is_null(&self) -> bool {
        self.block_hash == NULL_BLOCK_HASH
    }

    pub fn hash(&self) -> VoteHash {
        *self.cached_hash.get_or_init(|| keccak256(alloy_rlp::encode(self)))
    }

    pub fn voter(&self) -> Result<Address, EntityError> {
        if let Some(voter) = self.cached_voter.get() {
            return Ok(*voter);
        }
        let voter = ecdsa::recover_signer(&self.unsigned_hash(), &recoverable(&self.signature))?;
        let _ = self.cached_voter.set(voter);
        Ok(voter)
    }

    /// Weight assigned during verification; zero until then.
    pub fn weight(&self) -> u64 {
        self.weight.get().copied().unwrap_or(0)
    }

    pub fn set_weight(&self, weight: u64) {
        let _ = self.weight.set(weight);
    }

    /// The VRF sortition message for coordinates `(period, round, step)`.
    pub fn sortition_message(period: PbftPeriod, round: PbftRound, step: PbftStep) -> Vec<u8> {
        let payload_length = period.length() + round.length() + step.length();
        let mut out = Vec::with_capacity(payload_length + 2);
        Header { list: true, payload_length }.encode(&mut out);
        period.encode(&mut out);
        round.encode(&mut out);
        step.encode(&mut out);
        out
    }

    fn unsigned_hash(&self) -> B256 {
        let mut out = Vec::new();
        let payload_length = self.fields_length(false);
        Header { list: true, payload_length }.encode(&mut out);
        self.encode_fields(&mut out, false);
        keccak256(out)
    }

    fn fields_length(&self, with_signature: bool) -> usize {
        let mut len = self.block_hash.length()
            + (self.vote_type as u8).length()
            + self.period.length()
            + self.round.length()
            + self.step.length()
            + self.vrf_proof.length();
        if with_signature {
            len += self.signature.length();
        }
        len
    }

    fn encode_fields(&self, out: &mut dyn BufMut, with_signature: bool) {
        self.block_hash.encode(out);
        (self.vote_type as u8).encode(out);
        self.period.encode(out);
        self.round.encode(out);
        self.step.encode(out);
        self.vrf_proof.encode(out);
        if with_signature {
            self.signature.encode(out);
        }
    }
}

impl PartialEq for Vote {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Vote {}

impl Encodable for Vote {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.fields_length(true);
        Header { list: true, payload_length }.encode(out);
        self.encode_fields(out, true);
    }

    fn length(&self) -> usize {
        let payload_length = self.fields_length(true);
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Vote {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            block_hash: B256::decode(buf)?,
            vote_type: VoteType::from_u8(u8::decode(buf)?)
                .ok_or(alloy_rlp::Error::Custom("unknown vote type"))?,
            period: PbftPeriod::decode(buf)?,
            round: PbftRound::decode(buf)?,
            step: PbftStep::decode(buf)?,
            vrf_proof: Signature65::decode(buf)?,
            signature: Signature65::decode(buf)?,
            cached_hash: OnceLock::new(),
            cached_voter: OnceLock::new(),
            weight: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::vrf::VrfKeyPair;

    fn keypair() -> KeyPair {
        KeyPair::from_secret_bytes(&[0x33; 32]).unwrap()
    }

    fn sample_vote(step: PbftStep, vote_type: VoteType) -> Vote {
        let vrf = VrfKeyPair::from_secret_bytes(&[0x44; 32]).unwrap();
        let proof = vrf.prove(&Vote::sortition_message(4, 2, step)).unwrap();
        Vote::new(B256::repeat_byte(0xCC), vote_type, 4, 2, step, &proof, &keypair()).unwrap()
    }

    #[test]
    fn test_rlp_roundtrip() {
        let vote = sample_vote(3, VoteType::Cert);
        let encoded = alloy_rlp::encode(&vote);
        let decoded = Vote::decode(&mut encoded.as_slice()).unwrap();

        assert_eq!(vote, decoded);
        assert_eq!(decoded.vote_type(), VoteType::Cert);
        assert_eq!(decoded.period(), 4);
        assert_eq!(decoded.round(), 2);
        assert_eq!(decoded.voter().unwrap(), keypair().address());
    }

    #[test]
    fn test_unknown_vote_type_rejected() {
        let vote = sample_vote(1, VoteType::Propose);
        let mut encoded = alloy_rlp::encode(&vote);
        // The type byte sits right after the list header and the 33-byte
        // encoded block hash (0xa0 prefix + 32 bytes).
        let header = Header::decode(&mut encoded.as_slice()).unwrap();
        let header_len = encoded.len() - header.payload_length;
        encoded[header_len + 33] = 9;
        assert!(Vote::decode(&mut encoded.as_slice()).is_err());
    }

    #[test]
    fn test_weight_set_once() {
        let vote = sample_vote(3, VoteType::Cert);
        assert_eq!(vote.weight(), 0);
        vote.set_weight(7);
        vote.set_weight(9);
        assert_eq!(vote.weight(), 7);
    }

    #[test]
    fn test_null_vote() {
        let vrf = VrfKeyPair::generate();
        let proof = vrf.prove(&Vote::sortition_message(1, 1, 5)).unwrap();
        let vote =
            Vote::new(NULL_BLOCK_HASH, VoteType::Next, 1, 1, 5, &proof, &keypair()).unwrap();
        assert!(vote.is_null());
    }
}
