//! PBFT blocks and period data.
//!
//! A PBFT block finalizes one period: it names the anchor DAG block, the
//! keccak of the anchor's ordered DAG set, the cert-vote hashes of the
//! previous period it rewards, and (on epoch boundaries) the pillar block
//! produced alongside.

use crate::{primitives::*, vote::Vote, DagBlock, EntityError, Transaction};
use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use shared_crypto::ecdsa::{self, KeyPair};
use shared_crypto::hashing::keccak256;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct PbftBlock {
    prev_block_hash: PbftHash,
    pivot_dag_block_hash: BlockHash,
    order_hash: B256,
    /// Zero outside pillar epochs.
    pillar_block_hash: PillarHash,
    period: PbftPeriod,
    timestamp: u64,
    reward_votes: Vec<VoteHash>,
    signature: Signature65,

    cached_hash: OnceLock<PbftHash>,
    cached_proposer: OnceLock<Address>,
}

impl PbftBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prev_block_hash: PbftHash,
        pivot_dag_block_hash: BlockHash,
        order_hash: B256,
        pillar_block_hash: PillarHash,
        period: PbftPeriod,
        timestamp: u64,
        reward_votes: Vec<VoteHash>,
        keypair: &KeyPair,
    ) -> Result<Self, EntityError> {
        let mut block = Self {
            prev_block_hash,
            pivot_dag_block_hash,
            order_hash,
            pillar_block_hash,
            period,
            timestamp,
            reward_votes,
            signature: Signature65::ZERO,
            cached_hash: OnceLock::new(),
            cached_proposer: OnceLock::new(),
        };
        let sig = keypair.sign_hash(&block.unsigned_hash())?;
        block.signature = signature_bytes(&sig);
        let _ = block.cached_proposer.set(keypair.address());
        Ok(block)
    }

    pub fn prev_block_hash(&self) -> PbftHash {
        self.prev_block_hash
    }

    pub fn pivot_dag_block_hash(&self) -> BlockHash {
        self.pivot_dag_block_hash
    }

    pub fn order_hash(&self) -> B256 {
        self.order_hash
    }

    pub fn pillar_block_hash(&self) -> Option<PillarHash> {
        (self.pillar_block_hash != B256::ZERO).then_some(self.pillar_block_hash)
    }

    pub fn period(&self) -> PbftPeriod {
        self.period
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn reward_votes(&self) -> &[VoteHash] {
        &self.reward_votes
    }

    /// A null-anchor block advances the period without finalizing DAG state.
    pub fn has_null_anchor(&self) -> bool {
        self.pivot_dag_block_hash == NULL_BLOCK_HASH
    }

    pub fn hash(&self) -> PbftHash {
        *self.cached_hash.get_or_init(|| keccak256(alloy_rlp::encode(self)))
    }

    pub fn proposer(&self) -> Result<Address, EntityError> {
        if let Some(proposer) = self.cached_proposer.get() {
            return Ok(*proposer);
        }
        let proposer =
            ecdsa::recover_signer(&self.unsigned_hash(), &recoverable(&self.signature))?;
        let _ = self.cached_proposer.set(proposer);
        Ok(proposer)
    }

    pub fn verify_sig(&self) -> bool {
        self.proposer().is_ok()
    }

    fn unsigned_hash(&self) -> B256 {
        let mut out = Vec::new();
        let payload_length = self.fields_length(false);
        Header { list: true, payload_length }.encode(&mut out);
        self.encode_fields(&mut out, false);
        keccak256(out)
    }

    fn fields_length(&self, with_signature: bool) -> usize {
        let mut len = self.prev_block_hash.length()
            + self.pivot_dag_block_hash.length()
            + self.order_hash.length()
            + self.pillar_block_hash.length()
            + self.period.length()
            + self.timestamp.length()
            + self.reward_votes.length();
        if with_signature {
            len += self.signature.length();
        }
        len
    }

    fn encode_fields(&self, out: &mut dyn BufMut, with_signature: bool) {
        self.prev_block_hash.encode(out);
        self.pivot_dag_block_hash.encode(out);
        self.order_hash.encode(out);
        self.pillar_block_hash.encode(out);
        self.period.encode(out);
        self.timestamp.encode(out);
        self.reward_votes.encode(out);
        if with_signature {
            self.signature.encode(out);
        }
    }
}

impl PartialEq for PbftBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for PbftBlock {}

impl Encodable for PbftBlock {
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

impl Decodable for PbftBlock {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            prev_block_hash: PbftHash::decode(buf)?,
            pivot_dag_block_hash: BlockHash::decode(buf)?,
            order_hash: B256::decode(buf)?,
            pillar_block_hash: PillarHash::decode(buf)?,
            period: PbftPeriod::decode(buf)?,
            timestamp: u64::decode(buf)?,
            reward_votes: Vec::<VoteHash>::decode(buf)?,
            signature: Signature65::decode(buf)?,
            cached_hash: OnceLock::new(),
            cached_proposer: OnceLock::new(),
        })
    }
}

/// Hash of the ordered DAG block set a PBFT block finalizes.
pub fn calculate_order_hash(order: &[BlockHash]) -> B256 {
    let payload_length = order.iter().map(Encodable::length).sum::<usize>();
    let mut out = Vec::with_capacity(payload_length + 4);
    Header { list: true, payload_length }.encode(&mut out);
    for hash in order {
        hash.encode(&mut out);
    }
    keccak256(out)
}

/// Everything needed to replay one finalized period: the PBFT block, the
/// cert-votes that finalized the *previous* block, and the full DAG block
/// and transaction payloads of this period's anchor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodData {
    pub pbft_block: PbftBlock,
    pub previous_block_cert_votes: Vec<Vote>,
    pub dag_blocks: Vec<DagBlock>,
    pub transactions: Vec<Transaction>,
}

impl PeriodData {
    pub fn new(
        pbft_block: PbftBlock,
        previous_block_cert_votes: Vec<Vote>,
        dag_blocks: Vec<DagBlock>,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            pbft_block,
            previous_block_cert_votes,
            dag_blocks,
            transactions,
        }
    }

    fn payload_length(&self) -> usize {
        self.pbft_block.length()
            + self.previous_block_cert_votes.length()
            + self.dag_blocks.length()
            + self.transactions.length()
    }
}

impl Encodable for PeriodData {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.payload_length();
        Header { list: true, payload_length }.encode(out);
        self.pbft_block.encode(out);
        self.previous_block_cert_votes.encode(out);
        self.dag_blocks.encode(out);
        self.transactions.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for PeriodData {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Self {
            pbft_block: PbftBlock::decode(buf)?,
            previous_block_cert_votes: Vec::<Vote>::decode(buf)?,
            dag_blocks: Vec::<DagBlock>::decode(buf)?,
            transactions: Vec::<Transaction>::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> KeyPair {
        KeyPair::from_secret_bytes(&[0x55; 32]).unwrap()
    }

    fn sample_block(period: PbftPeriod) -> PbftBlock {
        PbftBlock::new(
            B256::repeat_byte(0x10),
            B256::repeat_byte(0x20),
            calculate_order_hash(&[B256::repeat_byte(0x20)]),
            B256::ZERO,
            period,
            1_700_000_123,
            vec![B256::repeat_byte(0x30)],
            &keypair(),
        )
        .unwrap()
    }

    #[test]
    fn test_rlp_roundtrip() {
        let block = sample_block(9);
        let encoded = alloy_rlp::encode(&block);
        let decoded = PbftBlock::decode(&mut encoded.as_slice()).unwrap();

        assert_eq!(block, decoded);
        assert_eq!(decoded.period(), 9);
        assert_eq!(decoded.proposer().unwrap(), keypair().address());
        assert_eq!(decoded.pillar_block_hash(), None);
    }

    #[test]
    fn test_pillar_hash_presence() {
        let block = PbftBlock::new(
            B256::ZERO,
            B256::repeat_byte(0x20),
            B256::ZERO,
            B256::repeat_byte(0x99),
            4,
            0,
            vec![],
            &keypair(),
        )
        .unwrap();
        assert_eq!(block.pillar_block_hash(), Some(B256::repeat_byte(0x99)));
    }

    #[test]
    fn test_order_hash_is_order_sensitive() {
        let a = B256::repeat_byte(0x01);
        let b = B256::repeat_byte(0x02);
        assert_ne!(calculate_order_hash(&[a, b]), calculate_order_hash(&[b, a]));
    }

    #[test]
    fn test_period_data_roundtrip() {
        let data = PeriodData::new(sample_block(3), vec![], vec![], vec![]);
        let encoded = alloy_rlp::encode(&data);
        let decoded = PeriodData::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(data, decoded);
    }
}
