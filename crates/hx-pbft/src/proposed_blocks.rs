//! Registry of proposed PBFT blocks per period.
//!
//! Propose-votes reference blocks by hash; the block payloads land here
//! (from our own proposer or from vote packets) until one of them is
//! cert-voted into the chain.

use parking_lot::RwLock;
use shared_types::{PbftBlock, PbftHash, PbftPeriod};
use std::collections::HashMap;

#[derive(Default)]
pub struct ProposedBlocks {
    blocks: RwLock<HashMap<PbftPeriod, HashMap<PbftHash, PbftBlock>>>,
}

impl ProposedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the block was already known.
    pub fn push_proposed_block(&self, block: PbftBlock) -> bool {
        let mut blocks = self.blocks.write();
        blocks
            .entry(block.period())
            .or_default()
            .insert(block.hash(), block)
            .is_none()
    }

    pub fn get_block(&self, period: PbftPeriod, hash: &PbftHash) -> Option<PbftBlock> {
        self.blocks.read().get(&period)?.get(hash).cloned()
    }

    pub fn is_block_known(&self, period: PbftPeriod, hash: &PbftHash) -> bool {
        self.blocks
            .read()
            .get(&period)
            .is_some_and(|m| m.contains_key(hash))
    }

    /// Drop every period below `min_period`.
    pub fn cleanup_old_blocks(&self, min_period: PbftPeriod) {
        self.blocks.write().retain(|period, _| *period >= min_period);
    }
}
