//! # Pillar Chain Manager
//!
//! Every `pillar_blocks_interval` periods (from the ficus activation
//! onward) the manager snapshots the finalized state into a pillar block:
//! state root, epoch, previous pillar hash, and the validator stake deltas
//! since the last pillar block. Validators sign the pillar hash with their
//! BLS keys; the block finalizes at 2t+1 signature weight so external
//! bridges can verify one aggregate.

use hx_final_chain::StateApi;
use hx_storage::{DbBatch, DbStorage};
use parking_lot::RwLock;
use shared_bus::{EventBus, NodeEvent};
use shared_crypto::bls::{
    aggregate_pillar_certificate, PillarBlsKeys, PillarBlsPublicKey, PillarBlsSignature,
    PillarCertificate,
};
use shared_types::{
    two_t_plus_one, Address, FicusHardfork, PbftPeriod, PillarBlock, PillarHash, PillarVote,
    ValidatorStakeChange, B256, I256, U256,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Periods between creating a pillar block and first gossiping our own
/// vote, giving slower nodes time to construct the same block.
pub const VOTE_BROADCAST_DELAY_PERIODS: u64 = 2;

/// Every this many finalized periods the node checks whether the latest
/// pillar block still lacks 2t+1 votes and requests a bundle if so.
pub const CHECK_LATEST_PILLAR_VOTES_PERIODS: u64 = 5;

/// Network port for pillar vote gossip, injected after construction.
pub trait PillarVoteGossiper: Send + Sync {
    fn gossip_pillar_vote(&self, vote: &PillarVote);
}

#[derive(Debug, Clone, Error)]
pub enum PillarError {
    #[error("vote does not match the current pillar block")]
    NotRelevant,

    #[error("invalid pillar vote: {0}")]
    InvalidVote(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<hx_storage::StorageError> for PillarError {
    fn from(err: hx_storage::StorageError) -> Self {
        PillarError::Storage(err.to_string())
    }
}

struct PillarInner {
    current_block: Option<PillarBlock>,
    /// Unique by signer, for the current block only.
    votes: HashMap<Address, PillarVote>,
    votes_weight: u64,
    threshold: u64,
    finalized: bool,
    /// Our own vote, held back until the broadcast delay elapses.
    pending_own_vote: Option<(PbftPeriod, PillarVote)>,
}

pub struct PillarChainManager {
    ficus: FicusHardfork,
    node_addr: Address,
    bls_keys: Arc<PillarBlsKeys>,
    db: Arc<DbStorage>,
    state: Arc<dyn StateApi>,
    bus: Arc<EventBus>,
    network: RwLock<Option<Arc<dyn PillarVoteGossiper>>>,
    inner: RwLock<PillarInner>,
}

impl PillarChainManager {
    pub fn new(
        ficus: FicusHardfork,
        node_addr: Address,
        bls_keys: Arc<PillarBlsKeys>,
        db: Arc<DbStorage>,
        state: Arc<dyn StateApi>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, PillarError> {
        let mut inner = PillarInner {
            current_block: None,
            votes: HashMap::new(),
            votes_weight: 0,
            threshold: 0,
            finalized: false,
            pending_own_vote: None,
        };
        if let Some(block) = db.latest_pillar_block()? {
            let votes = db.pillar_votes(&block.hash())?;
            inner.threshold = threshold_for(&*state, block.period());
            for vote in votes {
                inner.votes_weight += vote_weight(&*state, &vote);
                inner.votes.insert(vote.signer(), vote);
            }
            inner.finalized = inner.threshold > 0 && inner.votes_weight >= inner.threshold;
            inner.current_block = Some(block);
        }
        Ok(Arc::new(Self {
            ficus,
            node_addr,
            bls_keys,
            db,
            state,
            bus,
            network: RwLock::new(None),
            inner: RwLock::new(inner),
        }))
    }

    pub fn set_network(&self, network: Arc<dyn PillarVoteGossiper>) {
        *self.network.write() = Some(network);
    }

    pub fn current_pillar_block(&self) -> Option<PillarBlock> {
        self.inner.read().current_block.clone()
    }

    /// Hash the PBFT block at `period` should carry, when any.
    pub fn pillar_block_hash_for_proposal(&self, period: PbftPeriod) -> B256 {
        if !self.ficus.is_pillar_block_period(period) {
            return B256::ZERO;
        }
        self.inner
            .read()
            .current_block
            .as_ref()
            .map(|b| b.hash())
            .unwrap_or(B256::ZERO)
    }

    /// `(period, hash)` of the current pillar block when it still lacks
    /// 2t+1 votes — the periodic check requests a bundle for it.
    pub fn needs_votes(&self) -> Option<(PbftPeriod, PillarHash)> {
        let inner = self.inner.read();
        let block = inner.current_block.as_ref()?;
        (!inner.finalized).then(|| (block.period(), block.hash()))
    }

    /// Hook invoked on every finalized period.
    pub fn on_finalized_period(
        &self,
        period: PbftPeriod,
        state_root: B256,
    ) -> Result<(), PillarError> {
        if self.ficus.is_pillar_block_period(period) {
            self.create_pillar_block(period, state_root)?;
        }
        self.flush_pending_own_vote(period);
        Ok(())
    }

    fn create_pillar_block(&self, period: PbftPeriod, state_root: B256) -> Result<(), PillarError> {
        let (previous_hash, previous_stakes) = {
            let inner = self.inner.read();
            match &inner.current_block {
                Some(prev) => {
                    let stakes = self
                        .state
                        .dpos_validators_stakes(prev.period())
                        .unwrap_or_default();
                    (prev.hash(), stakes)
                }
                None => (B256::ZERO, vec![]),
            }
        };
        let current_stakes = self
            .state
            .dpos_validators_stakes(period)
            .map_err(|e| PillarError::InvalidVote(e.to_string()))?;

        let epoch = period / self.ficus.pillar_blocks_interval.max(1);
        let block = PillarBlock::new(
            period,
            state_root,
            B256::ZERO,
            epoch,
            previous_hash,
            stake_deltas(&previous_stakes, &current_stakes),
        );
        let pillar_hash = block.hash();

        let mut batch = DbBatch::new();
        batch.put_pillar_block(&block);
        // The previous block reached 2t+1 long ago; its individual votes
        // are no longer needed.
        if previous_hash != B256::ZERO {
            batch.delete_pillar_votes(&previous_hash);
        }
        self.db.commit(batch)?;

        let mut inner = self.inner.write();
        inner.current_block = Some(block);
        inner.votes.clear();
        inner.votes_weight = 0;
        inner.threshold = threshold_for(&*self.state, period);
        inner.finalized = false;

        info!(period, %pillar_hash, epoch, "pillar block created");

        // Sign our own vote now, broadcast after the delay window.
        if self
            .state
            .dpos_is_eligible(period, &self.node_addr)
            .unwrap_or(false)
        {
            let vote = PillarVote::new(period, pillar_hash, self.node_addr, &self.bls_keys);
            inner.pending_own_vote = Some((period + VOTE_BROADCAST_DELAY_PERIODS, vote.clone()));
            drop(inner);
            // Count it locally right away.
            let _ = self.add_verified_pillar_vote(&vote);
        }
        Ok(())
    }

    fn flush_pending_own_vote(&self, period: PbftPeriod) {
        let vote = {
            let mut inner = self.inner.write();
            match &inner.pending_own_vote {
                Some((due, vote)) if *due <= period => {
                    let vote = vote.clone();
                    inner.pending_own_vote = None;
                    Some(vote)
                }
                _ => None,
            }
        };
        if let Some(vote) = vote {
            let network = self.network.read().clone();
            if let Some(network) = network {
                network.gossip_pillar_vote(&vote);
            }
        }
    }

    /// Whether a vote targets the current pillar block and is not yet held.
    pub fn is_relevant_pillar_vote(&self, vote: &PillarVote) -> bool {
        let inner = self.inner.read();
        let Some(block) = &inner.current_block else {
            return false;
        };
        vote.pillar_block_hash() == block.hash()
            && vote.period() == block.period()
            && !inner.votes.contains_key(&vote.signer())
    }

    /// Full validation: signer eligibility plus BLS verification against
    /// the signer's registered key.
    pub fn validate_pillar_vote(&self, vote: &PillarVote) -> Result<(), PillarError> {
        let signer = vote.signer();
        let eligible = self
            .state
            .dpos_is_eligible(vote.period(), &signer)
            .map_err(|e| PillarError::InvalidVote(e.to_string()))?;
        if !eligible {
            return Err(PillarError::InvalidVote(format!(
                "signer {signer} not eligible at period {}",
                vote.period()
            )));
        }
        let key_bytes = self
            .state
            .dpos_bls_key(vote.period(), &signer)
            .map_err(|e| PillarError::InvalidVote(e.to_string()))?
            .ok_or_else(|| PillarError::InvalidVote("signer has no bls key".into()))?;
        let key = PillarBlsPublicKey::from_bytes(&key_bytes.0)
            .map_err(|e| PillarError::InvalidVote(e.to_string()))?;
        vote.verify(&key)
            .map_err(|e| PillarError::InvalidVote(e.to_string()))
    }

    /// Add a verified vote; returns true when it was new. Finalizes the
    /// pillar block when 2t+1 weight is reached.
    pub fn add_verified_pillar_vote(&self, vote: &PillarVote) -> Result<bool, PillarError> {
        let (pillar_hash, all_votes, finalize) = {
            let mut inner = self.inner.write();
            let Some(block) = &inner.current_block else {
                return Err(PillarError::NotRelevant);
            };
            if vote.pillar_block_hash() != block.hash() || vote.period() != block.period() {
                return Err(PillarError::NotRelevant);
            }
            if inner.votes.contains_key(&vote.signer()) {
                return Ok(false);
            }
            let pillar_hash = block.hash();
            inner.votes.insert(vote.signer(), vote.clone());
            inner.votes_weight += vote_weight(&*self.state, vote);
            let finalize = !inner.finalized
                && inner.threshold > 0
                && inner.votes_weight >= inner.threshold;
            if finalize {
                inner.finalized = true;
            }
            let all_votes: Vec<PillarVote> = inner.votes.values().cloned().collect();
            (pillar_hash, all_votes, finalize)
        };

        let mut batch = DbBatch::new();
        batch.put_pillar_votes(&pillar_hash, &all_votes);
        self.db.commit(batch)?;

        debug!(%pillar_hash, signer = %vote.signer(), "pillar vote added");
        if finalize {
            let period = vote.period();
            info!(period, %pillar_hash, "pillar block finalized with 2t+1 weight");
            match self.build_certificate(&pillar_hash) {
                Ok(certificate) => {
                    info!(
                        %pillar_hash,
                        signers = certificate.signer_count(),
                        "pillar certificate assembled"
                    );
                }
                Err(err) => warn!(%pillar_hash, %err, "pillar certificate assembly failed"),
            }
            self.bus.publish(NodeEvent::PillarBlockFinalized {
                period,
                pillar_hash,
            });
        }
        Ok(true)
    }

    /// Fold the collected votes into the bridge-facing certificate: one
    /// aggregate signature plus the aggregate of the signers' registered
    /// keys.
    pub fn build_certificate(
        &self,
        pillar_hash: &PillarHash,
    ) -> Result<PillarCertificate, PillarError> {
        let votes = self.get_verified_pillar_votes(pillar_hash);
        let mut pairs: Vec<(PillarBlsPublicKey, PillarBlsSignature)> =
            Vec::with_capacity(votes.len());
        for vote in &votes {
            let key_bytes = self
                .state
                .dpos_bls_key(vote.period(), &vote.signer())
                .map_err(|e| PillarError::InvalidVote(e.to_string()))?
                .ok_or_else(|| PillarError::InvalidVote("signer has no bls key".into()))?;
            let key = PillarBlsPublicKey::from_bytes(&key_bytes.0)
                .map_err(|e| PillarError::InvalidVote(e.to_string()))?;
            let signature = vote
                .bls_signature()
                .map_err(|e| PillarError::InvalidVote(e.to_string()))?;
            pairs.push((key, signature));
        }
        aggregate_pillar_certificate(pillar_hash, &pairs)
            .map_err(|e| PillarError::InvalidVote(e.to_string()))
    }

    /// Votes for a pillar block, serving bundle requests.
    pub fn get_verified_pillar_votes(&self, pillar_hash: &PillarHash) -> Vec<PillarVote> {
        {
            let inner = self.inner.read();
            if let Some(block) = &inner.current_block {
                if block.hash() == *pillar_hash {
                    return inner.votes.values().cloned().collect();
                }
            }
        }
        self.db.pillar_votes(pillar_hash).unwrap_or_default()
    }
}

fn threshold_for(state: &dyn StateApi, period: PbftPeriod) -> u64 {
    state
        .dpos_eligible_total_vote_count(period)
        .map(two_t_plus_one)
        .unwrap_or(0)
}

fn vote_weight(state: &dyn StateApi, vote: &PillarVote) -> u64 {
    state
        .dpos_eligible_vote_count(vote.period(), &vote.signer())
        .unwrap_or(0)
}

/// Per-validator stake deltas between two snapshots.
fn stake_deltas(
    previous: &[(Address, U256)],
    current: &[(Address, U256)],
) -> Vec<ValidatorStakeChange> {
    let prev_map: HashMap<Address, U256> = previous.iter().copied().collect();
    let curr_map: HashMap<Address, U256> = current.iter().copied().collect();

    let mut addresses: Vec<Address> = prev_map.keys().chain(curr_map.keys()).copied().collect();
    addresses.sort();
    addresses.dedup();

    let mut deltas = Vec::new();
    for address in addresses {
        let before = prev_map.get(&address).copied().unwrap_or(U256::ZERO);
        let after = curr_map.get(&address).copied().unwrap_or(U256::ZERO);
        if before == after {
            continue;
        }
        let delta = if after >= before {
            I256::try_from(after - before)
        } else {
            I256::try_from(before - after).map(|d| -d)
        };
        match delta {
            Ok(delta) => deltas.push(ValidatorStakeChange::new(address, delta)),
            Err(_) => warn!(%address, "stake delta overflows i256, skipped"),
        }
    }
    deltas
}
