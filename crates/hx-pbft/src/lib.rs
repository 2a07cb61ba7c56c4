//! # PBFT Finality
//!
//! The pipelined consensus layer:
//!
//! - `chain`: the finalized PBFT block chain and its head record
//! - `vote_manager`: verification, deduplication, 2t+1 accounting, reward
//!   votes, double-vote detection
//! - `manager`: the cooperative 5-step state machine driving proposals,
//!   votes and period finalization
//! - `period_data_queue`: ordered hand-off from PBFT sync to the driver
//! - `proposed_blocks`: registry of candidate blocks per period
//! - `slashing`: double-voting proof submission

pub mod chain;
pub mod manager;
pub mod period_data_queue;
pub mod proposed_blocks;
pub mod slashing;
pub mod vote_manager;

pub use chain::PbftChain;
pub use manager::{PbftManager, PbftState};
pub use period_data_queue::PeriodDataQueue;
pub use proposed_blocks::ProposedBlocks;
pub use slashing::SlashingManager;
pub use vote_manager::{VoteError, VoteManager};

use shared_types::{PbftBlock, Vote};

/// Network port for consensus gossip, injected after construction.
pub trait ConsensusGossiper: Send + Sync {
    /// Gossip a single vote, optionally bundled with the block it is for
    /// (propose votes travel with their block).
    fn gossip_vote(&self, vote: &Vote, block: Option<&PbftBlock>);

    /// Gossip a 2t+1 vote bundle.
    fn gossip_votes_bundle(&self, votes: &[Vote]);
}

/// Verified votes older than this many periods behind the chain head are
/// pruned from the vote manager.
pub const VOTE_RETENTION_PERIODS: u64 = 10;
