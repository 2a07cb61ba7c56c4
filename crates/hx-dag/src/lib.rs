//! # DAG Manager
//!
//! Admission, ordering and expiry of the block DAG:
//!
//! - `graph`: adjacency structures (total DAG + pivot tree, ghost path)
//! - `manager`: the `DagManager` itself
//! - `sortition_params`: per-period VDF parameter lookup
//!
//! The manager owns the only mutable view of the non-finalized DAG. PBFT
//! consumes it through `get_dag_block_order` / `set_dag_block_order`; the
//! proposer through `get_latest_pivot_and_tips`.

pub mod graph;
pub mod manager;
pub mod sortition_params;

pub use graph::{Dag, PivotTree};
pub use manager::{DagFrontier, DagManager, VerifyBlockStatus};
pub use sortition_params::SortitionParamsManager;

use shared_types::{BlockHash, DagBlock, Level, Transaction};
use thiserror::Error;

/// Network-facing gossip port, injected after construction to break the
/// manager ↔ network cycle.
pub trait DagBlockGossiper: Send + Sync {
    fn gossip_dag_block(&self, block: &DagBlock, trxs: &[Transaction], proposed: bool);
}

#[derive(Debug, Clone, Error)]
pub enum DagError {
    /// Block references parents the DAG does not hold yet; carries the
    /// missing hashes so sync can request them.
    #[error("missing pivot or tips ({0:?})")]
    MissingTipsOrPivot(Vec<BlockHash>),

    /// Declared level does not match `1 + max(parent levels)`.
    #[error("level {declared} does not match expected {expected}")]
    LevelMismatch { declared: Level, expected: Level },

    /// Below the expiry horizon.
    #[error("block level {level} below expiry level {expiry}")]
    Expired { level: Level, expiry: Level },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<hx_storage::StorageError> for DagError {
    fn from(err: hx_storage::StorageError) -> Self {
        DagError::Storage(err.to_string())
    }
}
