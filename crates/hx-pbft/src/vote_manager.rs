//! # Vote Manager
//!
//! Verification and accounting of PBFT votes.
//!
//! ## Verification pipeline
//!
//! 1. Signature recovers the voter.
//! 2. `dpos_eligible_vote_count(period, voter) > 0`.
//! 3. VRF proof verifies against the voter's registered key over
//!    `period ‖ round ‖ step`.
//! 4. The VRF output clears the committee sortition threshold.
//! 5. Not a duplicate by hash; not a second vote at the same coordinates
//!    with a different value (that is a double-voting proof).
//!
//! Verified votes are indexed `period → round → (type, step)` with
//! per-value weight sums so 2t+1 queries are O(1) after insertion.

use hx_final_chain::{StateApi, StateApiError};
use parking_lot::RwLock;
use shared_crypto::ecdsa::KeyPair;
use shared_crypto::vrf::{sortition, VrfKeyPair};
use shared_types::{
    two_t_plus_one, Address, BlockHash, PbftHash, PbftPeriod, PbftRound, PbftStep, Vote, VoteHash,
    VoteType,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum VoteError {
    #[error("vote signature does not recover")]
    InvalidSignature,

    #[error("voter {voter} not eligible at period {period}")]
    NotEligible { voter: Address, period: PbftPeriod },

    #[error("vrf proof invalid")]
    InvalidVrfProof,

    #[error("vrf output over sortition threshold")]
    SortitionFailed,

    /// Eligibility cannot be evaluated yet; cache and retry after sync.
    #[error("vote period ahead of state")]
    FutureBlock,

    #[error("vote already known")]
    Duplicate,

    /// Same voter, same coordinates, different value. Carries the earlier
    /// vote so the caller can assemble a slashing proof.
    #[error("double vote detected")]
    DoubleVote { existing: Box<Vote> },
}

#[derive(Debug, Default)]
struct StepVotes {
    by_hash: HashMap<VoteHash, Vote>,
    by_voter: HashMap<Address, VoteHash>,
    /// Accumulated weight per voted value.
    weights: HashMap<BlockHash, u64>,
}

type RoundIndex = HashMap<(VoteType, PbftStep), StepVotes>;

#[derive(Default)]
struct VoteInner {
    verified: BTreeMap<PbftPeriod, HashMap<PbftRound, RoundIndex>>,
    /// Hashes that already passed full verification, with their period
    /// (for pruning) and assigned weight (re-applied to fresh copies).
    validated: HashMap<VoteHash, (PbftPeriod, u64)>,
    /// Cert votes of the latest finalized block, embedded as reward votes
    /// by the next proposal.
    reward_votes: HashMap<VoteHash, Vote>,
    reward_votes_block: PbftHash,
}

pub struct VoteManager {
    node_keys: Arc<KeyPair>,
    vrf_keys: Arc<VrfKeyPair>,
    committee_size: u64,
    state: Arc<dyn StateApi>,
    inner: RwLock<VoteInner>,
}

impl VoteManager {
    pub fn new(
        node_keys: Arc<KeyPair>,
        vrf_keys: Arc<VrfKeyPair>,
        committee_size: u64,
        state: Arc<dyn StateApi>,
    ) -> Self {
        Self {
            node_keys,
            vrf_keys,
            committee_size,
            state,
            inner: RwLock::new(VoteInner::default()),
        }
    }

    /// 2t+1 threshold for a period's total eligible weight.
    pub fn two_t_plus_one_threshold(&self, period: PbftPeriod) -> Option<u64> {
        self.state
            .dpos_eligible_total_vote_count(period)
            .ok()
            .map(two_t_plus_one)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Run the full verification pipeline; assigns the vote's weight.
    pub fn verify_vote(&self, vote: &Vote) -> Result<(), VoteError> {
        // A re-received copy of a validated vote keeps its weight.
        if let Some((_, weight)) = self.inner.read().validated.get(&vote.hash()) {
            vote.set_weight(*weight);
            return Ok(());
        }
        let voter = vote.voter().map_err(|_| VoteError::InvalidSignature)?;

        let weight = match self.state.dpos_eligible_vote_count(vote.period(), &voter) {
            Ok(weight) => weight,
            Err(StateApiError::FutureBlock { .. }) => return Err(VoteError::FutureBlock),
            Err(_) => return Err(VoteError::NotEligible { voter, period: vote.period() }),
        };
        if weight == 0 {
            return Err(VoteError::NotEligible { voter, period: vote.period() });
        }

        let vrf_key = match self.state.dpos_vrf_key(vote.period(), &voter) {
            Ok(Some(key)) => key,
            Ok(None) => return Err(VoteError::InvalidVrfProof),
            Err(StateApiError::FutureBlock { .. }) => return Err(VoteError::FutureBlock),
            Err(_) => return Err(VoteError::InvalidVrfProof),
        };
        let message = Vote::sortition_message(vote.period(), vote.round(), vote.step());
        let output = vote
            .vrf_proof()
            .verify(&vrf_key, &message)
            .map_err(|_| VoteError::InvalidVrfProof)?;

        let total = self
            .state
            .dpos_eligible_total_vote_count(vote.period())
            .map_err(|_| VoteError::FutureBlock)?;
        if !sortition(&output, weight, total, self.committee_size) {
            return Err(VoteError::SortitionFailed);
        }

        vote.set_weight(weight);
        self.inner
            .write()
            .validated
            .insert(vote.hash(), (vote.period(), weight));
        Ok(())
    }

    pub fn vote_already_validated(&self, hash: &VoteHash) -> bool {
        self.inner.read().validated.contains_key(hash)
    }

    // =========================================================================
    // Verified store
    // =========================================================================

    /// Insert a verified vote. `Ok(false)` for a duplicate; a conflicting
    /// vote at the same coordinates yields [`VoteError::DoubleVote`] and is
    /// not stored.
    pub fn add_verified_vote(&self, vote: &Vote) -> Result<bool, VoteError> {
        let voter = vote.voter().map_err(|_| VoteError::InvalidSignature)?;
        let mut inner = self.inner.write();
        let step_votes = inner
            .verified
            .entry(vote.period())
            .or_default()
            .entry(vote.round())
            .or_default()
            .entry((vote.vote_type(), vote.step()))
            .or_default();

        if step_votes.by_hash.contains_key(&vote.hash()) {
            return Ok(false);
        }
        if let Some(existing_hash) = step_votes.by_voter.get(&voter) {
            let existing = step_votes.by_hash[existing_hash].clone();
            if existing.block_hash() != vote.block_hash() {
                warn!(
                    %voter,
                    period = vote.period(),
                    round = vote.round(),
                    step = vote.step(),
                    "double vote detected"
                );
                return Err(VoteError::DoubleVote {
                    existing: Box::new(existing),
                });
            }
            return Ok(false);
        }

        *step_votes.weights.entry(vote.block_hash()).or_default() += vote.weight();
        step_votes.by_voter.insert(voter, vote.hash());
        step_votes.by_hash.insert(vote.hash(), vote.clone());
        debug!(
            hash = %vote.hash(),
            period = vote.period(),
            round = vote.round(),
            step = vote.step(),
            "verified vote stored"
        );
        Ok(true)
    }

    pub fn vote_in_verified_map(&self, vote: &Vote) -> bool {
        self.inner
            .read()
            .verified
            .get(&vote.period())
            .and_then(|rounds| rounds.get(&vote.round()))
            .and_then(|index| index.get(&(vote.vote_type(), vote.step())))
            .is_some_and(|sv| sv.by_hash.contains_key(&vote.hash()))
    }

    /// All verified votes of a period (every round, type and step).
    pub fn get_verified_votes(&self, period: PbftPeriod) -> Vec<Vote> {
        let inner = self.inner.read();
        inner
            .verified
            .get(&period)
            .into_iter()
            .flat_map(|rounds| rounds.values())
            .flat_map(|index| index.values())
            .flat_map(|sv| sv.by_hash.values())
            .cloned()
            .collect()
    }

    /// Verified votes at `(period, round)`.
    pub fn get_round_votes(&self, period: PbftPeriod, round: PbftRound) -> Vec<Vote> {
        let inner = self.inner.read();
        inner
            .verified
            .get(&period)
            .and_then(|rounds| rounds.get(&round))
            .into_iter()
            .flat_map(|index| index.values())
            .flat_map(|sv| sv.by_hash.values())
            .cloned()
            .collect()
    }

    /// Propose-votes of a round (step 1), for leader selection.
    pub fn get_proposal_votes(&self, period: PbftPeriod, round: PbftRound) -> Vec<Vote> {
        let inner = self.inner.read();
        inner
            .verified
            .get(&period)
            .and_then(|rounds| rounds.get(&round))
            .and_then(|index| index.get(&(VoteType::Propose, 1)))
            .into_iter()
            .flat_map(|sv| sv.by_hash.values())
            .cloned()
            .collect()
    }

    /// The value holding ≥ 2t+1 weight for `(period, round, type)`, if any.
    ///
    /// Soft and cert votes live at their canonical steps; next-votes are
    /// scanned per polling step, each step accounted independently.
    pub fn get_two_t_plus_one_voted_block(
        &self,
        period: PbftPeriod,
        round: PbftRound,
        vote_type: VoteType,
    ) -> Option<(BlockHash, u64)> {
        let threshold = self.two_t_plus_one_threshold(period)?;
        if threshold == 0 {
            return None;
        }
        let inner = self.inner.read();
        let index = inner.verified.get(&period)?.get(&round)?;

        let candidates: Vec<&StepVotes> = match vote_type {
            VoteType::Next => index
                .iter()
                .filter(|((t, _), _)| *t == VoteType::Next)
                .map(|(_, sv)| sv)
                .collect(),
            other => index
                .get(&(other, other.canonical_step()))
                .into_iter()
                .collect(),
        };
        for step_votes in candidates {
            for (block_hash, weight) in &step_votes.weights {
                if *weight >= threshold {
                    return Some((*block_hash, *weight));
                }
            }
        }
        None
    }

    /// The votes backing a 2t+1 result, for bundle replies.
    pub fn get_two_t_plus_one_votes(
        &self,
        period: PbftPeriod,
        round: PbftRound,
        vote_type: VoteType,
        block_hash: &BlockHash,
    ) -> Vec<Vote> {
        let Some(threshold) = self.two_t_plus_one_threshold(period) else {
            return vec![];
        };
        let inner = self.inner.read();
        let Some(index) = inner.verified.get(&period).and_then(|r| r.get(&round)) else {
            return vec![];
        };
        let steps: Vec<&StepVotes> = match vote_type {
            VoteType::Next => index
                .iter()
                .filter(|((t, _), _)| *t == VoteType::Next)
                .map(|(_, sv)| sv)
                .collect(),
            other => index
                .get(&(other, other.canonical_step()))
                .into_iter()
                .collect(),
        };
        for step_votes in steps {
            if step_votes.weights.get(block_hash).copied().unwrap_or(0) >= threshold {
                return step_votes
                    .by_hash
                    .values()
                    .filter(|v| v.block_hash() == *block_hash)
                    .cloned()
                    .collect();
            }
        }
        vec![]
    }

    // =========================================================================
    // Own votes
    // =========================================================================

    /// Generate our vote at the given coordinates, when sortition selects
    /// us. `Ok(None)` means not selected this time.
    pub fn generate_vote(
        &self,
        block_hash: BlockHash,
        vote_type: VoteType,
        period: PbftPeriod,
        round: PbftRound,
        step: PbftStep,
    ) -> Result<Option<Vote>, VoteError> {
        let address = self.node_keys.address();
        let weight = match self.state.dpos_eligible_vote_count(period, &address) {
            Ok(weight) => weight,
            Err(StateApiError::FutureBlock { .. }) => return Err(VoteError::FutureBlock),
            Err(_) => return Ok(None),
        };
        if weight == 0 {
            return Ok(None);
        }
        let total = self
            .state
            .dpos_eligible_total_vote_count(period)
            .map_err(|_| VoteError::FutureBlock)?;

        let message = Vote::sortition_message(period, round, step);
        let proof = self
            .vrf_keys
            .prove(&message)
            .map_err(|_| VoteError::InvalidVrfProof)?;
        if !sortition(&proof.output(), weight, total, self.committee_size) {
            return Ok(None);
        }

        let vote = Vote::new(
            block_hash,
            vote_type,
            period,
            round,
            step,
            &proof,
            &self.node_keys,
        )
        .map_err(|_| VoteError::InvalidSignature)?;
        vote.set_weight(weight);
        Ok(Some(vote))
    }

    // =========================================================================
    // Reward votes
    // =========================================================================

    /// Replace the reward-vote candidates with the cert votes that just
    /// finalized `block_hash`.
    pub fn replace_reward_votes(&self, block_hash: PbftHash, cert_votes: &[Vote]) {
        let mut inner = self.inner.write();
        inner.reward_votes = cert_votes
            .iter()
            .map(|vote| (vote.hash(), vote.clone()))
            .collect();
        inner.reward_votes_block = block_hash;
    }

    /// Hashes a new proposal should embed.
    pub fn reward_votes_hashes(&self) -> Vec<VoteHash> {
        let mut hashes: Vec<VoteHash> = self.inner.read().reward_votes.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Resolve embedded reward-vote hashes; `None` when any is unknown.
    pub fn get_reward_votes(&self, hashes: &[VoteHash]) -> Option<Vec<Vote>> {
        let inner = self.inner.read();
        hashes
            .iter()
            .map(|hash| inner.reward_votes.get(hash).cloned())
            .collect()
    }

    // =========================================================================
    // Relevance & retention
    // =========================================================================

    /// A vote is worth keeping iff it is at the current period within one
    /// round of the current one, or one period ahead.
    pub fn is_pbft_relevant_vote(
        &self,
        vote: &Vote,
        current_period: PbftPeriod,
        current_round: PbftRound,
    ) -> bool {
        if vote.period() == current_period {
            return vote.round() + 1 >= current_round && vote.round() <= current_round + 1;
        }
        vote.period() == current_period + 1
    }

    /// Drop verified votes and validation markers below `min_period`.
    pub fn cleanup_votes_by_period(&self, min_period: PbftPeriod) {
        let mut inner = self.inner.write();
        inner.verified = inner.verified.split_off(&min_period);
        inner.validated.retain(|_, (period, _)| *period >= min_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_final_chain::InMemoryState;
    use shared_types::{BlsPkBytes, GenesisConfig, GenesisValidator, B256, U256};

    struct Validator {
        keys: Arc<KeyPair>,
        vrf: Arc<VrfKeyPair>,
    }

    fn setup(count: u8) -> (Vec<Validator>, Arc<InMemoryState>, VoteManager) {
        let mut genesis = GenesisConfig::default();
        let mut validators = Vec::new();
        for i in 0..count {
            let keys = Arc::new(KeyPair::from_secret_bytes(&[0x60 + i; 32]).unwrap());
            let vrf = Arc::new(VrfKeyPair::from_secret_bytes(&[0x70 + i; 32]).unwrap());
            genesis.validators.push(GenesisValidator {
                address: keys.address(),
                vrf_key: vrf.public_key(),
                bls_key: BlsPkBytes::ZERO,
                stake: U256::from(1_000u64),
            });
            validators.push(Validator { keys, vrf });
        }
        let state = Arc::new(InMemoryState::from_genesis(&genesis));
        let manager = VoteManager::new(
            validators[0].keys.clone(),
            validators[0].vrf.clone(),
            // Committee covers everyone: sortition always passes.
            1000,
            state.clone(),
        );
        (validators, state, manager)
    }

    fn vote_from(validator: &Validator, block: u8, vote_type: VoteType, step: PbftStep) -> Vote {
        let proof = validator
            .vrf
            .prove(&Vote::sortition_message(1, 1, step))
            .unwrap();
        Vote::new(
            B256::repeat_byte(block),
            vote_type,
            1,
            1,
            step,
            &proof,
            &validator.keys,
        )
        .unwrap()
    }

    #[test]
    fn test_verify_assigns_weight() {
        let (validators, _, manager) = setup(3);
        let vote = vote_from(&validators[1], 0xAA, VoteType::Cert, 3);

        manager.verify_vote(&vote).unwrap();
        assert_eq!(vote.weight(), 1);
        assert!(manager.vote_already_validated(&vote.hash()));
    }

    #[test]
    fn test_unknown_voter_rejected() {
        let (_, _, manager) = setup(3);
        let stranger = Validator {
            keys: Arc::new(KeyPair::from_secret_bytes(&[0xE0; 32]).unwrap()),
            vrf: Arc::new(VrfKeyPair::generate()),
        };
        let vote = vote_from(&stranger, 0xAA, VoteType::Cert, 3);
        assert!(matches!(
            manager.verify_vote(&vote),
            Err(VoteError::NotEligible { .. })
        ));
    }

    #[test]
    fn test_forged_vrf_rejected() {
        let (validators, _, manager) = setup(3);
        // Vote signed by validator 1 but carrying validator 2's proof.
        let proof = validators[2]
            .vrf
            .prove(&Vote::sortition_message(1, 1, 3))
            .unwrap();
        let vote = Vote::new(
            B256::repeat_byte(0xAA),
            VoteType::Cert,
            1,
            1,
            3,
            &proof,
            &validators[1].keys,
        )
        .unwrap();
        assert!(matches!(
            manager.verify_vote(&vote),
            Err(VoteError::InvalidVrfProof)
        ));
    }

    #[test]
    fn test_far_future_period_cached_as_future() {
        let (validators, _, manager) = setup(3);
        let proof = validators[1]
            .vrf
            .prove(&Vote::sortition_message(9, 1, 3))
            .unwrap();
        let vote = Vote::new(
            B256::repeat_byte(0xAA),
            VoteType::Cert,
            9,
            1,
            3,
            &proof,
            &validators[1].keys,
        )
        .unwrap();
        assert!(matches!(manager.verify_vote(&vote), Err(VoteError::FutureBlock)));
    }

    #[test]
    fn test_two_t_plus_one_accumulates() {
        let (validators, _, manager) = setup(3);
        // 3 validators × 1 vote: threshold is 2.
        for validator in &validators[..2] {
            let vote = vote_from(validator, 0xAA, VoteType::Cert, 3);
            manager.verify_vote(&vote).unwrap();
            manager.add_verified_vote(&vote).unwrap();
        }

        let (block, weight) = manager
            .get_two_t_plus_one_voted_block(1, 1, VoteType::Cert)
            .unwrap();
        assert_eq!(block, B256::repeat_byte(0xAA));
        assert_eq!(weight, 2);

        let bundle = manager.get_two_t_plus_one_votes(1, 1, VoteType::Cert, &block);
        assert_eq!(bundle.len(), 2);
    }

    #[test]
    fn test_split_votes_reach_no_quorum() {
        let (validators, _, manager) = setup(3);
        let targets = [0xAA, 0xBB, 0xCC];
        for (validator, target) in validators.iter().zip(targets) {
            let vote = vote_from(validator, target, VoteType::Cert, 3);
            manager.verify_vote(&vote).unwrap();
            manager.add_verified_vote(&vote).unwrap();
        }
        assert!(manager
            .get_two_t_plus_one_voted_block(1, 1, VoteType::Cert)
            .is_none());
    }

    #[test]
    fn test_double_vote_detected() {
        let (validators, _, manager) = setup(3);
        let first = vote_from(&validators[1], 0xAA, VoteType::Cert, 3);
        let second = vote_from(&validators[1], 0xBB, VoteType::Cert, 3);
        manager.verify_vote(&first).unwrap();
        manager.verify_vote(&second).unwrap();

        manager.add_verified_vote(&first).unwrap();
        match manager.add_verified_vote(&second) {
            Err(VoteError::DoubleVote { existing }) => {
                assert_eq!(existing.hash(), first.hash());
            }
            other => panic!("expected DoubleVote, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_vote_not_double_counted() {
        let (validators, _, manager) = setup(3);
        let vote = vote_from(&validators[1], 0xAA, VoteType::Cert, 3);
        manager.verify_vote(&vote).unwrap();
        assert!(manager.add_verified_vote(&vote).unwrap());
        assert!(!manager.add_verified_vote(&vote).unwrap());

        let inner_weight = manager
            .get_two_t_plus_one_votes(1, 1, VoteType::Cert, &vote.block_hash())
            .len();
        assert!(inner_weight <= 1);
    }

    #[test]
    fn test_next_votes_counted_per_step() {
        let (validators, _, manager) = setup(3);
        // Two validators next-vote NULL in step 5, one in step 6: quorum
        // exists within step 5 only.
        for validator in &validators[..2] {
            let vote = vote_from(validator, 0x00, VoteType::Next, 5);
            manager.verify_vote(&vote).unwrap();
            manager.add_verified_vote(&vote).unwrap();
        }
        let vote = vote_from(&validators[2], 0x00, VoteType::Next, 6);
        manager.verify_vote(&vote).unwrap();
        manager.add_verified_vote(&vote).unwrap();

        let (block, _) = manager
            .get_two_t_plus_one_voted_block(1, 1, VoteType::Next)
            .unwrap();
        assert!(block.is_zero());
    }

    #[test]
    fn test_generate_vote_for_eligible_self() {
        let (_, _, manager) = setup(3);
        let vote = manager
            .generate_vote(B256::repeat_byte(0x11), VoteType::Soft, 1, 1, 2)
            .unwrap()
            .expect("full committee always selects");
        assert_eq!(vote.weight(), 1);
        manager.verify_vote(&vote).unwrap();
    }

    #[test]
    fn test_relevance_window() {
        let (validators, _, manager) = setup(3);
        let vote = vote_from(&validators[0], 0xAA, VoteType::Next, 5);
        // vote has period 1, round 1.
        assert!(manager.is_pbft_relevant_vote(&vote, 1, 1));
        assert!(manager.is_pbft_relevant_vote(&vote, 1, 2));
        assert!(!manager.is_pbft_relevant_vote(&vote, 1, 3));
        // One period ahead of current: kept.
        assert!(manager.is_pbft_relevant_vote(&vote, 0, 1));
        assert!(!manager.is_pbft_relevant_vote(&vote, 3, 1));
    }

    #[test]
    fn test_cleanup_drops_old_periods() {
        let (validators, _, manager) = setup(3);
        let vote = vote_from(&validators[0], 0xAA, VoteType::Cert, 3);
        manager.verify_vote(&vote).unwrap();
        manager.add_verified_vote(&vote).unwrap();

        manager.cleanup_votes_by_period(2);
        assert!(manager.get_verified_votes(1).is_empty());
        assert!(!manager.vote_already_validated(&vote.hash()));
    }

    #[test]
    fn test_reward_votes_roundtrip() {
        let (validators, _, manager) = setup(3);
        let cert = vote_from(&validators[0], 0xAA, VoteType::Cert, 3);
        manager.replace_reward_votes(B256::repeat_byte(0xAA), &[cert.clone()]);

        let hashes = manager.reward_votes_hashes();
        assert_eq!(hashes, vec![cert.hash()]);
        assert_eq!(manager.get_reward_votes(&hashes).unwrap().len(), 1);
        assert!(manager
            .get_reward_votes(&[B256::repeat_byte(0x99)])
            .is_none());
    }
}
