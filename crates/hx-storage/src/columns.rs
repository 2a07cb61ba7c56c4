//! Column family catalogue.
//!
//! Every persisted artifact lives in exactly one column family so pruning,
//! iteration and compaction tuning stay per-concern.

/// All column families of the node database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// DAG blocks by hash (RLP).
    DagBlocks,
    /// Non-finalized DAG block hashes by level (big-endian u64 key, RLP list).
    DagBlocksLevel,
    /// Anchor hash → ordered finalized DAG block hashes (RLP list).
    DagFinalizedBlocks,
    /// Transactions by hash (RLP).
    Transactions,
    /// Transaction hash → finalization period (big-endian u64).
    TrxPeriod,
    /// Period (big-endian u64) → full period data (RLP).
    PeriodData,
    /// PBFT block hash → period (big-endian u64).
    PbftBlockPeriod,
    /// Singleton PBFT chain head record (bincode).
    PbftHead,
    /// PBFT block hash → cert votes that finalized it (RLP list).
    CertVotes,
    /// Singleton: own next-votes of the current round (RLP list).
    NextVotes,
    /// Max-level (big-endian u64) → proposal period (big-endian u64).
    ProposalPeriodLevels,
    /// Pillar block period (big-endian u64) → pillar block (RLP).
    PillarBlocks,
    /// Pillar block hash → collected pillar votes (RLP list).
    PillarVotes,
    /// Period (big-endian u64) → sortition params record (bincode).
    SortitionParamsChange,
    /// Final chain execution metadata (bincode).
    FinalChainMeta,
    /// Genesis hash and database version markers.
    Genesis,
    /// Node status counters (DAG vertex/edge totals).
    Status,
}

impl Column {
    pub const ALL: &'static [Column] = &[
        Column::DagBlocks,
        Column::DagBlocksLevel,
        Column::DagFinalizedBlocks,
        Column::Transactions,
        Column::TrxPeriod,
        Column::PeriodData,
        Column::PbftBlockPeriod,
        Column::PbftHead,
        Column::CertVotes,
        Column::NextVotes,
        Column::ProposalPeriodLevels,
        Column::PillarBlocks,
        Column::PillarVotes,
        Column::SortitionParamsChange,
        Column::FinalChainMeta,
        Column::Genesis,
        Column::Status,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::DagBlocks => "dag_blocks",
            Column::DagBlocksLevel => "dag_blocks_level",
            Column::DagFinalizedBlocks => "dag_finalized_blocks",
            Column::Transactions => "transactions",
            Column::TrxPeriod => "trx_period",
            Column::PeriodData => "period_data",
            Column::PbftBlockPeriod => "pbft_block_period",
            Column::PbftHead => "pbft_head",
            Column::CertVotes => "cert_votes",
            Column::NextVotes => "next_votes",
            Column::ProposalPeriodLevels => "proposal_period_levels",
            Column::PillarBlocks => "pillar_blocks",
            Column::PillarVotes => "pillar_votes",
            Column::SortitionParamsChange => "sortition_params_change",
            Column::FinalChainMeta => "final_chain_meta",
            Column::Genesis => "genesis",
            Column::Status => "status",
        }
    }
}
