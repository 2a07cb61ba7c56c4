//! # Verifiable Delay Function (VDF) Sortition
//!
//! Gates DAG block emission: a proposer must spend real sequential time
//! before a block is valid, with the required delay scaled by stake.
//!
//! ## Construction
//!
//! 1. VRF proof over the proposal-period input binds the lottery to the
//!    proposer's registered key.
//! 2. The VRF output selects a difficulty: proposers that clear the stake
//!    threshold draw one from `[difficulty_min, difficulty_max]`, everyone
//!    else gets `difficulty_stale`.
//! 3. Delay: iterate keccak-256 `2^difficulty` times over the block
//!    message seeded with the VRF output — sequential, not parallelizable.
//!
//! Verification recomputes the chain. Difficulties are kept small enough
//! that verification stays cheap relative to network latency; a production
//! deployment would swap the chain for a Wesolowski proof behind the same
//! interface.

use crate::{
    hashing::{keccak256, keccak256_pair},
    vrf::{sortition, VrfKeyPair, VrfProof, VrfPublicKey},
    CryptoError,
};
use alloy_primitives::B256;

/// VDF difficulty selection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdfParams {
    /// Lowest difficulty drawable by a threshold-clearing proposer.
    pub difficulty_min: u16,
    /// Highest difficulty drawable by a threshold-clearing proposer.
    pub difficulty_max: u16,
    /// Difficulty assigned below the stake threshold.
    pub difficulty_stale: u16,
    /// Wall-clock budget for solving; exceeding it marks the solution stale.
    pub lambda_bound_ms: u64,
    /// Committee-size analog for the proposer lottery.
    pub vrf_selection: u64,
}

impl Default for VdfParams {
    fn default() -> Self {
        Self {
            difficulty_min: 16,
            difficulty_max: 20,
            difficulty_stale: 22,
            lambda_bound_ms: 1500,
            vrf_selection: 20,
        }
    }
}

/// A VDF solution attached to a DAG block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdfSortition {
    /// Proof of the proposer lottery draw.
    pub vrf_proof: VrfProof,
    /// Difficulty the draw selected.
    pub difficulty: u16,
    /// Final element of the keccak chain; zero until `solve` runs.
    pub output: B256,
}

impl VdfSortition {
    /// Draw a difficulty for this proposer at the given proposal period.
    ///
    /// `vrf_input` is the sortition message (proposal period hash and block
    /// level); `vote_count`/`total_count` come from the DPoS state at the
    /// proposal period.
    pub fn new(
        params: &VdfParams,
        keys: &VrfKeyPair,
        vrf_input: &[u8],
        vote_count: u64,
        total_count: u64,
    ) -> Result<Self, CryptoError> {
        let vrf_proof = keys.prove(vrf_input)?;
        let difficulty = Self::difficulty_from(params, &vrf_proof.output(), vote_count, total_count);
        Ok(Self {
            vrf_proof,
            difficulty,
            output: B256::ZERO,
        })
    }

    /// Run the sequential delay over the block message.
    pub fn solve(&mut self, vdf_message: &[u8]) {
        self.output = chain(
            keccak256_pair(vdf_message, self.vrf_proof.output()),
            iterations(self.difficulty),
        );
    }

    /// Verify the lottery draw and the delay chain.
    pub fn verify(
        &self,
        params: &VdfParams,
        public_key: &VrfPublicKey,
        vrf_input: &[u8],
        vdf_message: &[u8],
        vote_count: u64,
        total_count: u64,
    ) -> Result<(), CryptoError> {
        let vrf_output = self.vrf_proof.verify(public_key, vrf_input)?;

        let expected_difficulty = Self::difficulty_from(params, &vrf_output, vote_count, total_count);
        if self.difficulty != expected_difficulty {
            return Err(CryptoError::InvalidVdf(format!(
                "difficulty {} does not match drawn {}",
                self.difficulty, expected_difficulty
            )));
        }

        let expected = chain(
            keccak256_pair(vdf_message, vrf_output),
            iterations(self.difficulty),
        );
        if self.output != expected {
            return Err(CryptoError::InvalidVdf("output mismatch".into()));
        }
        Ok(())
    }

    /// Whether this solution carries the stale (penalty) difficulty.
    pub fn is_stale(&self, params: &VdfParams) -> bool {
        self.difficulty >= params.difficulty_stale
    }

    fn difficulty_from(params: &VdfParams, vrf_output: &B256, vote_count: u64, total_count: u64) -> u16 {
        if !sortition(vrf_output, vote_count, total_count, params.vrf_selection) {
            return params.difficulty_stale;
        }
        let span = params.difficulty_max - params.difficulty_min + 1;
        params.difficulty_min + (vrf_output.0[31] as u16) % span
    }
}

fn iterations(difficulty: u16) -> u64 {
    1u64 << difficulty.min(40)
}

fn chain(seed: B256, rounds: u64) -> B256 {
    let mut state = seed;
    for _ in 0..rounds {
        state = keccak256(state);
    }
    state
}
