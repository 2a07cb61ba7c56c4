//! # Core Chain Entities
//!
//! Defines the artifacts gossiped and persisted by the node, their RLP wire
//! encodings and cached identities, plus the protocol configuration.
//!
//! ## Clusters
//!
//! - **Chain**: `Transaction`, `DagBlock`
//! - **Consensus**: `Vote`, `PbftBlock`, `PeriodData`
//! - **Pillar chain**: `PillarBlock`, `PillarVote`
//! - **Configuration**: `GenesisConfig` and the per-subsystem config structs
//!
//! Every entity hashes as keccak-256 over its RLP encoding and recovers its
//! author from an embedded recoverable signature.

pub mod config;
pub mod dag_block;
pub mod pbft_block;
pub mod pillar;
pub mod primitives;
pub mod transaction;
pub mod vote;

pub use config::{
    two_t_plus_one, DagConfig, DposConfig, FicusHardfork, GenesisConfig, GenesisValidator,
    HardforksConfig, MagnoliaHardfork, PbftConfig, SortitionConfig, StateConfig,
};
pub use dag_block::DagBlock;
pub use pbft_block::{calculate_order_hash, PbftBlock, PeriodData};
pub use pillar::{PillarBlock, PillarVote, ValidatorStakeChange};
pub use primitives::*;
pub use transaction::Transaction;
pub use vote::{Vote, VoteType};

use thiserror::Error;

/// Errors raised while constructing or validating entities.
#[derive(Debug, Clone, Error)]
pub enum EntityError {
    /// Embedded signature does not recover to a well-formed author.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// RLP payload malformed.
    #[error("rlp decode failed: {0}")]
    Decode(String),

    /// A structural invariant does not hold (level arithmetic, tip count).
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<alloy_rlp::Error> for EntityError {
    fn from(err: alloy_rlp::Error) -> Self {
        EntityError::Decode(err.to_string())
    }
}

impl From<shared_crypto::CryptoError> for EntityError {
    fn from(err: shared_crypto::CryptoError) -> Self {
        EntityError::InvalidSignature(err.to_string())
    }
}
