//! Double-voting proof submission.
//!
//! When the vote manager observes two votes by one voter at the same
//! `(period, round, step, type)` with different block hashes, the proof is
//! packed as a `commitDoubleVotingProof(bytes,bytes)` call to the DPoS
//! system contract, signed with the node key and pushed into the pool like
//! any other transaction. The contract jails the offender.

use hx_final_chain::{abi, StateApi};
use hx_transaction_pool::TransactionPool;
use parking_lot::Mutex;
use shared_bus::{EventBus, NodeEvent};
use shared_crypto::ecdsa::KeyPair;
use shared_types::{Address, PbftPeriod, PbftRound, PbftStep, Transaction, Vote, U256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Gas budget for a proof transaction.
const PROOF_GAS: u64 = 1_000_000;

pub struct SlashingManager {
    node_keys: Arc<KeyPair>,
    chain_id: u64,
    pool: Arc<TransactionPool>,
    state: Arc<dyn StateApi>,
    bus: Arc<EventBus>,
    /// One in-flight proof per offender coordinates.
    submitted: Mutex<HashSet<(Address, PbftPeriod, PbftRound, PbftStep)>>,
}

impl SlashingManager {
    pub fn new(
        node_keys: Arc<KeyPair>,
        chain_id: u64,
        pool: Arc<TransactionPool>,
        state: Arc<dyn StateApi>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            node_keys,
            chain_id,
            pool,
            state,
            bus,
            submitted: Mutex::new(HashSet::new()),
        }
    }

    /// Pack and submit a double-voting proof. Returns true when a proof
    /// transaction entered the pool.
    pub fn submit_double_voting_proof(&self, vote_a: &Vote, vote_b: &Vote) -> bool {
        let (Ok(voter_a), Ok(voter_b)) = (vote_a.voter(), vote_b.voter()) else {
            return false;
        };
        if voter_a != voter_b
            || vote_a.period() != vote_b.period()
            || vote_a.round() != vote_b.round()
            || vote_a.step() != vote_b.step()
            || vote_a.vote_type() != vote_b.vote_type()
            || vote_a.block_hash() == vote_b.block_hash()
        {
            warn!("rejecting malformed double-voting proof");
            return false;
        }

        let key = (voter_a, vote_a.period(), vote_a.round(), vote_a.step());
        if !self.submitted.lock().insert(key) {
            return false;
        }

        let input = abi::commit_double_voting_proof(
            &alloy_rlp::encode(vote_a),
            &alloy_rlp::encode(vote_b),
        );
        let period = self.state.last_block_number();
        let nonce = self
            .state
            .nonce(period, &self.node_keys.address())
            .unwrap_or(0);
        let trx = match Transaction::new(
            nonce,
            U256::ZERO,
            self.pool.gas_pricer().bid(),
            PROOF_GAS,
            Some(abi::DPOS_CONTRACT_ADDRESS),
            input,
            self.chain_id,
            &self.node_keys,
        ) {
            Ok(trx) => trx,
            Err(err) => {
                warn!(%err, "failed to build double-voting proof transaction");
                return false;
            }
        };

        match self.pool.insert_transaction(trx) {
            Ok(()) => {
                info!(offender = %voter_a, period = vote_a.period(), "double-voting proof submitted");
                self.bus.publish(NodeEvent::DoubleVotingProofSubmitted {
                    offender: voter_a,
                    period: vote_a.period(),
                });
                true
            }
            Err(err) => {
                warn!(%err, "double-voting proof refused by pool");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_final_chain::InMemoryState;
    use hx_storage::DbStorage;
    use hx_transaction_pool::PoolConfig;
    use shared_crypto::vrf::VrfKeyPair;
    use shared_types::{GenesisConfig, VoteType, B256};
    use tempfile::TempDir;

    fn make_votes(voter: &KeyPair, hash_a: u8, hash_b: u8) -> (Vote, Vote) {
        let vrf = VrfKeyPair::generate();
        let proof = vrf.prove(&Vote::sortition_message(1, 1, 3)).unwrap();
        let a = Vote::new(
            B256::repeat_byte(hash_a),
            VoteType::Cert,
            1,
            1,
            3,
            &proof,
            voter,
        )
        .unwrap();
        let b = Vote::new(
            B256::repeat_byte(hash_b),
            VoteType::Cert,
            1,
            1,
            3,
            &proof,
            voter,
        )
        .unwrap();
        (a, b)
    }

    fn fixture() -> (TempDir, SlashingManager, Arc<TransactionPool>) {
        let node_keys = Arc::new(KeyPair::from_secret_bytes(&[0x51; 32]).unwrap());
        let mut genesis = GenesisConfig::default();
        genesis
            .state
            .initial_balances
            .push((node_keys.address(), U256::from(1_000_000_000u64)));

        let dir = TempDir::new().unwrap();
        let db = Arc::new(DbStorage::open(dir.path()).unwrap());
        let state = Arc::new(InMemoryState::from_genesis(&genesis));
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(TransactionPool::new(
            PoolConfig::default(),
            state.clone(),
            db,
            bus.clone(),
        ));
        let manager = SlashingManager::new(node_keys, 842, pool.clone(), state, bus);
        (dir, manager, pool)
    }

    #[test]
    fn test_valid_proof_lands_in_pool() {
        let (_dir, manager, pool) = fixture();
        let voter = KeyPair::from_secret_bytes(&[0x52; 32]).unwrap();
        let (a, b) = make_votes(&voter, 0x01, 0x02);

        assert!(manager.submit_double_voting_proof(&a, &b));
        assert_eq!(pool.pool_size(), 1);

        // Same coordinates are submitted once.
        assert!(!manager.submit_double_voting_proof(&a, &b));
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn test_agreeing_votes_rejected() {
        let (_dir, manager, pool) = fixture();
        let voter = KeyPair::from_secret_bytes(&[0x52; 32]).unwrap();
        let (a, _) = make_votes(&voter, 0x01, 0x02);

        assert!(!manager.submit_double_voting_proof(&a, &a.clone()));
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_votes_from_different_voters_rejected() {
        let (_dir, manager, pool) = fixture();
        let voter1 = KeyPair::from_secret_bytes(&[0x52; 32]).unwrap();
        let voter2 = KeyPair::from_secret_bytes(&[0x53; 32]).unwrap();
        let (a, _) = make_votes(&voter1, 0x01, 0x02);
        let (_, b) = make_votes(&voter2, 0x01, 0x02);

        assert!(!manager.submit_double_voting_proof(&a, &b));
        assert_eq!(pool.pool_size(), 0);
    }
}
