//! # Node Events
//!
//! The choreography events published by subsystems as their state changes.
//! Handlers in other subsystems and external observers (RPC subscriptions,
//! test harnesses) consume these through [`crate::EventBus`].

use shared_types::{BlockHash, Level, PbftHash, PbftPeriod, PillarHash, TrxHash};

/// All events that can be published to the node bus.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    // =========================================================================
    // TRANSACTION POOL
    // =========================================================================
    /// A transaction passed pool admission.
    TransactionAdded { trx_hash: TrxHash },

    // =========================================================================
    // DAG MANAGER
    // =========================================================================
    /// A DAG block was verified and inserted into the DAG.
    DagBlockAdded { block_hash: BlockHash, level: Level },

    /// An anchor commit re-rooted the DAG at a new period.
    DagPeriodCommitted {
        period: PbftPeriod,
        anchor: BlockHash,
        finalized_count: usize,
    },

    // =========================================================================
    // PBFT
    // =========================================================================
    /// A PBFT block reached 2t+1 cert weight and was pushed to the chain.
    PbftBlockFinalized {
        period: PbftPeriod,
        block_hash: PbftHash,
    },

    /// The consensus period counter advanced (null anchors included).
    PbftPeriodAdvanced { period: PbftPeriod },

    // =========================================================================
    // PILLAR CHAIN
    // =========================================================================
    /// A pillar block accumulated 2t+1 BLS signature weight.
    PillarBlockFinalized {
        period: PbftPeriod,
        pillar_hash: PillarHash,
    },

    // =========================================================================
    // SLASHING
    // =========================================================================
    /// A double-voting proof was packed and submitted to the pool.
    DoubleVotingProofSubmitted {
        offender: shared_types::Address,
        period: PbftPeriod,
    },
}
