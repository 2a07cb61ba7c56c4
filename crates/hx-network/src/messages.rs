//! Typed wire messages.
//!
//! Every packet body is a single RLP list. Variable-arity packets
//! (status, vote) are distinguished by their item count, and an item
//! count that matches no known shape is a protocol violation that
//! disconnects the peer.

use alloy_rlp::{BufMut, Decodable, Encodable, Header, RlpDecodable, RlpEncodable};
use shared_types::{
    BlockHash, DagBlock, NodeId, PbftBlock, PbftPeriod, PbftRound, PbftStep, PeriodData,
    PillarHash, PillarVote, Transaction, Vote, B256,
};

/// Maximum pillar votes a single bundle reply may carry.
pub const MAX_PILLAR_VOTES_IN_BUNDLE: usize = 250;

/// Count the items of the top-level RLP list in `payload`.
pub fn count_rlp_items(payload: &[u8]) -> alloy_rlp::Result<usize> {
    let mut buf = payload;
    let header = Header::decode(&mut buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    let mut items = buf;
    let mut count = 0;
    while !items.is_empty() {
        let item_header = Header::decode(&mut items)?;
        if item_header.payload_length > items.len() {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        items = &items[item_header.payload_length..];
        count += 1;
    }
    Ok(count)
}

// =============================================================================
// Status
// =============================================================================

/// First packet on a fresh connection; both sides prove compatibility.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct InitialStatusPacket {
    pub network_id: u64,
    pub chain_id: u64,
    pub genesis_hash: B256,
    pub tarcap_version: u16,
    pub pbft_chain_size: u64,
    pub pbft_round: PbftRound,
    pub dag_level: u64,
    pub is_light_node: bool,
    pub history_size: u64,
    pub node_major_version: u16,
    pub node_minor_version: u16,
    pub node_patch_version: u16,
}

/// Periodic status refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StatusUpdatePacket {
    pub pbft_chain_size: u64,
    pub pbft_round: PbftRound,
    pub dag_level: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusPacket {
    Initial(InitialStatusPacket),
    Update(StatusUpdatePacket),
}

impl Encodable for StatusPacket {
    fn encode(&self, out: &mut dyn BufMut) {
        match self {
            StatusPacket::Initial(packet) => packet.encode(out),
            StatusPacket::Update(packet) => packet.encode(out),
        }
    }

    fn length(&self) -> usize {
        match self {
            StatusPacket::Initial(packet) => packet.length(),
            StatusPacket::Update(packet) => packet.length(),
        }
    }
}

impl Decodable for StatusPacket {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        match count_rlp_items(buf)? {
            12 => Ok(StatusPacket::Initial(InitialStatusPacket::decode(buf)?)),
            3 => Ok(StatusPacket::Update(StatusUpdatePacket::decode(buf)?)),
            _ => Err(alloy_rlp::Error::Custom("unexpected status item count")),
        }
    }
}

// =============================================================================
// Block & transaction flow
// =============================================================================

/// A DAG block with the transactions the receiver may be missing.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct DagBlockPacket {
    pub block: DagBlock,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TransactionsPacket {
    pub transactions: Vec<Transaction>,
}

// =============================================================================
// Votes
// =============================================================================

/// A single vote; propose votes carry their block and the sender's chain
/// size so lagging receivers can tell they are behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotePacket {
    pub vote: Vote,
    pub block: Option<PbftBlock>,
    pub peer_chain_size: Option<u64>,
}

impl VotePacket {
    pub fn vote_only(vote: Vote) -> Self {
        Self {
            vote,
            block: None,
            peer_chain_size: None,
        }
    }

    pub fn with_block(vote: Vote, block: PbftBlock, peer_chain_size: u64) -> Self {
        Self {
            vote,
            block: Some(block),
            peer_chain_size: Some(peer_chain_size),
        }
    }
}

impl Encodable for VotePacket {
    fn encode(&self, out: &mut dyn BufMut) {
        let mut payload_length = self.vote.length();
        if let (Some(block), Some(size)) = (&self.block, &self.peer_chain_size) {
            payload_length += block.length() + size.length();
        }
        Header { list: true, payload_length }.encode(out);
        self.vote.encode(out);
        if let (Some(block), Some(size)) = (&self.block, &self.peer_chain_size) {
            block.encode(out);
            size.encode(out);
        }
    }

    fn length(&self) -> usize {
        let mut payload_length = self.vote.length();
        if let (Some(block), Some(size)) = (&self.block, &self.peer_chain_size) {
            payload_length += block.length() + size.length();
        }
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for VotePacket {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let items = count_rlp_items(buf)?;
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        match items {
            1 => Ok(Self {
                vote: Vote::decode(buf)?,
                block: None,
                peer_chain_size: None,
            }),
            3 => Ok(Self {
                vote: Vote::decode(buf)?,
                block: Some(PbftBlock::decode(buf)?),
                peer_chain_size: Some(u64::decode(buf)?),
            }),
            _ => Err(alloy_rlp::Error::Custom("unexpected vote packet item count")),
        }
    }
}

/// A 2t+1 bundle of votes sharing `(period, round, step)` coordinates.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct VotesBundlePacket {
    pub period: PbftPeriod,
    pub round: PbftRound,
    pub step: PbftStep,
    pub block_hash: BlockHash,
    pub votes: Vec<Vote>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetNextVotesSyncPacket {
    pub period: PbftPeriod,
    pub round: PbftRound,
}

// =============================================================================
// DAG sync
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetDagSyncPacket {
    pub period: PbftPeriod,
    pub known_blocks: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct DagSyncPacket {
    pub period: PbftPeriod,
    pub blocks: Vec<DagBlock>,
    pub transactions: Vec<Transaction>,
}

// =============================================================================
// PBFT sync
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetPbftSyncPacket {
    pub from_period: PbftPeriod,
}

/// One synced period. `cert_votes` proves the carried block directly (the
/// server always attaches the certificate it has on disk); `last` marks
/// the end of the server's window.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct PbftSyncPacket {
    pub period_data: PeriodData,
    pub cert_votes: Vec<Vote>,
    pub last: bool,
}

// =============================================================================
// Pillar sync
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct PillarVotePacket {
    pub vote: PillarVote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetPillarVotesBundlePacket {
    pub period: PbftPeriod,
    pub pillar_block_hash: PillarHash,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct PillarVotesBundlePacket {
    pub votes: Vec<PillarVote>,
}

/// Identity helper: hash a peer's node id for display.
pub fn short_id(node_id: &NodeId) -> String {
    format!("{:.8}", node_id.to_string())
}
