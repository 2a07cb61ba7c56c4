//! The finalized PBFT block chain.
//!
//! An append-only chain of cert-voted blocks. The head record (hash,
//! period, size) persists in the same batch that persists the block's
//! period data, so a crash can never leave the two inconsistent.

use hx_storage::{DbBatch, DbStorage, PbftHead};
use parking_lot::RwLock;
use shared_types::{PbftBlock, PbftHash, PbftPeriod, PeriodData, NULL_BLOCK_HASH};
use std::sync::Arc;
use tracing::info;

pub struct PbftChain {
    db: Arc<DbStorage>,
    head: RwLock<PbftHead>,
}

impl PbftChain {
    pub fn new(db: Arc<DbStorage>) -> Result<Self, hx_storage::StorageError> {
        let head = db.pbft_head()?.unwrap_or(PbftHead {
            last_block_hash: NULL_BLOCK_HASH,
            period: 0,
            chain_size: 0,
        });
        if head.chain_size > 0 {
            info!(
                period = head.period,
                hash = %head.last_block_hash,
                "pbft chain recovered"
            );
        }
        Ok(Self {
            db,
            head: RwLock::new(head),
        })
    }

    pub fn last_pbft_block_hash(&self) -> PbftHash {
        self.head.read().last_block_hash
    }

    /// Number of blocks in the chain; also the latest finalized period.
    pub fn size(&self) -> u64 {
        self.head.read().chain_size
    }

    pub fn head(&self) -> PbftHead {
        self.head.read().clone()
    }

    /// Chain linkage check: the block must extend the head exactly.
    pub fn check_pbft_block_validation(&self, block: &PbftBlock) -> bool {
        let head = self.head.read();
        block.prev_block_hash() == head.last_block_hash && block.period() == head.period + 1
    }

    /// Stage the head update into `batch`; call [`Self::apply_head`] after
    /// the batch commits.
    pub fn stage_push(&self, batch: &mut DbBatch, block: &PbftBlock) {
        batch.put_pbft_head(&PbftHead {
            last_block_hash: block.hash(),
            period: block.period(),
            chain_size: self.head.read().chain_size + 1,
        });
    }

    pub fn apply_head(&self, block: &PbftBlock) {
        let mut head = self.head.write();
        head.last_block_hash = block.hash();
        head.period = block.period();
        head.chain_size += 1;
    }

    pub fn get_pbft_block(&self, period: PbftPeriod) -> Option<PbftBlock> {
        self.db
            .period_data(period)
            .ok()
            .flatten()
            .map(|data| data.pbft_block)
    }

    pub fn get_period_data(&self, period: PbftPeriod) -> Option<PeriodData> {
        self.db.period_data(period).ok().flatten()
    }

    pub fn block_in_chain(&self, hash: &PbftHash) -> bool {
        self.db
            .period_for_pbft_block(hash)
            .ok()
            .flatten()
            .is_some()
    }
}
