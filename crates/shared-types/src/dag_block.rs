//! DAG blocks.
//!
//! A DAG block references one pivot parent and up to `max_tips` tip parents,
//! carries an ordered list of transaction hashes, and proves its right to
//! exist with a VDF solution bound to the proposer's VRF key at the block's
//! proposal period.

use crate::{primitives::*, EntityError};
use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use shared_crypto::ecdsa::{self, KeyPair};
use shared_crypto::hashing::keccak256;
use shared_crypto::vdf::{VdfParams, VdfSortition};
use shared_crypto::vrf::{VrfProof, VrfPublicKey};
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct DagBlock {
    pivot: BlockHash,
    level: Level,
    timestamp: u64,
    tips: Vec<BlockHash>,
    trxs: Vec<TrxHash>,
    gas_estimation: u64,
    vdf: VdfSortition,
    signature: Signature65,

    cached_hash: OnceLock<BlockHash>,
    cached_sender: OnceLock<Address>,
}

impl DagBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pivot: BlockHash,
        level: Level,
        timestamp: u64,
        tips: Vec<BlockHash>,
        trxs: Vec<TrxHash>,
        gas_estimation: u64,
        vdf: VdfSortition,
        keypair: &KeyPair,
    ) -> Result<Self, EntityError> {
        let mut block = Self {
            pivot,
            level,
            timestamp,
            tips,
            trxs,
            gas_estimation,
            vdf,
            signature: Signature65::ZERO,
            cached_hash: OnceLock::new(),
            cached_sender: OnceLock::new(),
        };
        let sig = keypair.sign_hash(&block.unsigned_hash())?;
        block.signature = signature_bytes(&sig);
        let _ = block.cached_sender.set(keypair.address());
        Ok(block)
    }

    /// The chain's genesis DAG block: level 0, null pivot, no payload.
    pub fn genesis(timestamp: u64, keypair: &KeyPair) -> Result<Self, EntityError> {
        Self::new(
            NULL_BLOCK_HASH,
            0,
            timestamp,
            vec![],
            vec![],
            0,
            zero_vdf(),
            keypair,
        )
    }

    pub fn pivot(&self) -> BlockHash {
        self.pivot
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn tips(&self) -> &[BlockHash] {
        &self.tips
    }

    pub fn trxs(&self) -> &[TrxHash] {
        &self.trxs
    }

    pub fn gas_estimation(&self) -> u64 {
        self.gas_estimation
    }

    pub fn vdf(&self) -> &VdfSortition {
        &self.vdf
    }

    pub fn difficulty(&self) -> u16 {
        self.vdf.difficulty
    }

    pub fn hash(&self) -> BlockHash {
        *self.cached_hash.get_or_init(|| keccak256(alloy_rlp::encode(self)))
    }

    pub fn sender(&self) -> Result<Address, EntityError> {
        if let Some(sender) = self.cached_sender.get() {
            return Ok(*sender);
        }
        let sender = ecdsa::recover_signer(&self.unsigned_hash(), &recoverable(&self.signature))?;
        let _ = self.cached_sender.set(sender);
        Ok(sender)
    }

    pub fn verify_sig(&self) -> bool {
        self.sender().is_ok()
    }

    /// All parents: pivot first, then tips in wire order.
    pub fn parents(&self) -> Vec<BlockHash> {
        let mut parents = Vec::with_capacity(1 + self.tips.len());
        parents.push(self.pivot);
        parents.extend_from_slice(&self.tips);
        parents
    }

    /// The message the VDF delay runs over: `rlp(pivot ‖ trx_hashes…)`.
    pub fn vdf_message(pivot: &BlockHash, trxs: &[TrxHash]) -> Vec<u8> {
        let payload_length = pivot.length() + trxs.iter().map(Encodable::length).sum::<usize>();
        let mut out = Vec::with_capacity(payload_length + 4);
        Header { list: true, payload_length }.encode(&mut out);
        pivot.encode(&mut out);
        for t in trxs {
            t.encode(&mut out);
        }
        out
    }

    /// The VRF input binding the lottery to the proposal period and level.
    pub fn vrf_input(proposal_period_hash: &B256, level: Level) -> Vec<u8> {
        let payload_length = proposal_period_hash.length() + level.length();
        let mut out = Vec::with_capacity(payload_length + 4);
        Header { list: true, payload_length }.encode(&mut out);
        proposal_period_hash.encode(&mut out);
        level.encode(&mut out);
        out
    }

    /// Verify the embedded VDF solution against the DPoS state at the
    /// block's proposal period.
    pub fn verify_vdf(
        &self,
        params: &VdfParams,
        proposal_period_hash: &B256,
        vrf_key: &VrfPublicKey,
        vote_count: u64,
        total_count: u64,
    ) -> Result<(), EntityError> {
        self.vdf
            .verify(
                params,
                vrf_key,
                &Self::vrf_input(proposal_period_hash, self.level),
                &Self::vdf_message(&self.pivot, &self.trxs),
                vote_count,
                total_count,
            )
            .map_err(EntityError::from)
    }

    fn unsigned_hash(&self) -> B256 {
        let mut out = Vec::new();
        let payload_length = self.fields_length(false);
        Header { list: true, payload_length }.encode(&mut out);
        self.encode_fields(&mut out, false);
        keccak256(out)
    }

    fn fields_length(&self, with_signature: bool) -> usize {
        let mut len = self.pivot.length()
            + self.level.length()
            + self.timestamp.length()
            + self.tips.length()
            + self.trxs.length()
            + self.gas_estimation.length()
            + vdf_length(&self.vdf);
        if with_signature {
            len += self.signature.length();
        }
        len
    }

    fn encode_fields(&self, out: &mut dyn BufMut, with_signature: bool) {
        self.pivot.encode(out);
        self.level.encode(out);
        self.timestamp.encode(out);
        self.tips.encode(out);
        self.trxs.encode(out);
        self.gas_estimation.encode(out);
        encode_vdf(&self.vdf, out);
        if with_signature {
            self.signature.encode(out);
        }
    }
}

impl PartialEq for DagBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for DagBlock {}

impl Encodable for DagBlock {
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

impl Decodable for DagBlock {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            pivot: BlockHash::decode(buf)?,
            level: Level::decode(buf)?,
            timestamp: u64::decode(buf)?,
            tips: Vec::<BlockHash>::decode(buf)?,
            trxs: Vec::<TrxHash>::decode(buf)?,
            gas_estimation: u64::decode(buf)?,
            vdf: decode_vdf(buf)?,
            signature: Signature65::decode(buf)?,
            cached_hash: OnceLock::new(),
            cached_sender: OnceLock::new(),
        })
    }
}

// Config files carry the signed genesis block as hex-encoded RLP.
impl serde::Serialize for DagBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = alloy_rlp::encode(self);
        serializer.serialize_str(&format!("0x{}", alloy_primitives::hex::encode(encoded)))
    }
}

impl<'de> serde::Deserialize<'de> for DagBlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = alloy_primitives::hex::decode(raw.trim_start_matches("0x"))
            .map_err(serde::de::Error::custom)?;
        DagBlock::decode(&mut bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}

fn zero_vdf() -> VdfSortition {
    VdfSortition {
        vrf_proof: VrfProof::from_bytes([0u8; 65]),
        difficulty: 0,
        output: B256::ZERO,
    }
}

fn vdf_payload_length(vdf: &VdfSortition) -> usize {
    let proof: Signature65 = Signature65::from(*vdf.vrf_proof.as_bytes());
    proof.length() + vdf.difficulty.length() + vdf.output.length()
}

fn vdf_length(vdf: &VdfSortition) -> usize {
    let payload_length = vdf_payload_length(vdf);
    payload_length + alloy_rlp::length_of_length(payload_length)
}

fn encode_vdf(vdf: &VdfSortition, out: &mut dyn BufMut) {
    let payload_length = vdf_payload_length(vdf);
    Header { list: true, payload_length }.encode(out);
    Signature65::from(*vdf.vrf_proof.as_bytes()).encode(out);
    vdf.difficulty.encode(out);
    vdf.output.encode(out);
}

fn decode_vdf(buf: &mut &[u8]) -> alloy_rlp::Result<VdfSortition> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    let proof = Signature65::decode(buf)?;
    let difficulty = u16::decode(buf)?;
    let output = B256::decode(buf)?;
    Ok(VdfSortition {
        vrf_proof: VrfProof::from_bytes(proof.0),
        difficulty,
        output,
    })
}
