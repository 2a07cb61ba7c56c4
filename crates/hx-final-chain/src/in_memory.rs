//! In-memory reference implementation of [`StateApi`].
//!
//! Executes value transfers, fee accounting, DPoS stake bookkeeping and
//! double-vote jailing against plain maps. Per-period stake snapshots give
//! historical DPoS queries; the state root is a keccak commitment over the
//! sorted account and validator sets.

use crate::{
    abi::{self, DposCall, DPOS_CONTRACT_ADDRESS},
    Account, ExecutionResult, FinalizationInput, StateApi, StateApiError, StateResult,
    TransactionReceipt,
};
use alloy_rlp::{Decodable, Encodable};
use parking_lot::RwLock;
use shared_crypto::hashing::keccak256;
use shared_crypto::vrf::VrfPublicKey;
use shared_types::{
    Address, BlsPkBytes, GenesisConfig, PbftPeriod, Transaction, TrxHash, Vote, B256, U256,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Gas charged for a plain transfer.
const TRANSFER_GAS: u64 = 21_000;
/// Extra gas per input byte for payload-carrying transactions.
const INPUT_BYTE_GAS: u64 = 16;
/// Flat reward minted for the proposer of a finalized block.
const PROPOSER_REWARD: u64 = 500;
/// Flat reward minted per rewarded cert-voter.
const VOTER_REWARD: u64 = 100;

#[derive(Debug, Clone)]
struct ValidatorEntry {
    stake: U256,
    vrf_key: VrfPublicKey,
    bls_key: BlsPkBytes,
    /// Last period the validator is jailed through; 0 when never jailed.
    jailed_until: PbftPeriod,
}

#[derive(Debug, Default)]
struct StateInner {
    accounts: HashMap<Address, Account>,
    validators: HashMap<Address, ValidatorEntry>,
    executed: PbftPeriod,
    state_roots: BTreeMap<PbftPeriod, B256>,
    stake_snapshots: BTreeMap<PbftPeriod, Vec<(Address, U256)>>,
    receipts: HashMap<TrxHash, TransactionReceipt>,
}

pub struct InMemoryState {
    dpos: shared_types::DposConfig,
    jail_time: u64,
    inner: RwLock<StateInner>,
}

impl InMemoryState {
    pub fn from_genesis(genesis: &GenesisConfig) -> Self {
        let mut inner = StateInner::default();
        for (address, balance) in &genesis.state.initial_balances {
            inner.accounts.insert(
                *address,
                Account {
                    balance: *balance,
                    nonce: 0,
                },
            );
        }
        for validator in &genesis.validators {
            inner.accounts.entry(validator.address).or_default();
            inner.validators.insert(
                validator.address,
                ValidatorEntry {
                    stake: validator.stake,
                    vrf_key: validator.vrf_key,
                    bls_key: validator.bls_key,
                    jailed_until: 0,
                },
            );
        }
        inner.stake_snapshots.insert(0, snapshot(&inner));
        inner.state_roots.insert(0, root_of(&inner));
        Self {
            dpos: genesis.state.dpos.clone(),
            jail_time: genesis.hardforks.magnolia.jail_time,
            inner: RwLock::new(inner),
        }
    }

    /// Receipt of an executed transaction, if any.
    pub fn receipt(&self, trx_hash: &TrxHash) -> Option<TransactionReceipt> {
        self.inner.read().receipts.get(trx_hash).cloned()
    }

    fn check_period(&self, period: PbftPeriod) -> StateResult<()> {
        let last = self.inner.read().executed;
        if period > last {
            return Err(StateApiError::FutureBlock {
                requested: period,
                last,
            });
        }
        Ok(())
    }

    /// DPoS queries look `delegation_delay` periods ahead of execution:
    /// stakes for period P were fixed at P - delay, so eligibility at the
    /// period currently being voted on is already answerable.
    fn check_dpos_period(&self, period: PbftPeriod) -> StateResult<()> {
        let last = self.inner.read().executed;
        if period > last + self.dpos.delegation_delay {
            return Err(StateApiError::FutureBlock {
                requested: period,
                last,
            });
        }
        Ok(())
    }

    /// Effective stake table for DPoS queries at `period`: the newest
    /// snapshot no later than `period - delegation_delay`.
    fn stakes_at(&self, inner: &StateInner, period: PbftPeriod) -> Vec<(Address, U256)> {
        let effective = period.saturating_sub(self.dpos.delegation_delay);
        inner
            .stake_snapshots
            .range(..=effective)
            .next_back()
            .or_else(|| inner.stake_snapshots.iter().next())
            .map(|(_, stakes)| stakes.clone())
            .unwrap_or_default()
    }

    fn vote_count_of(&self, stake: U256) -> u64 {
        if stake < self.dpos.eligibility_balance_threshold {
            return 0;
        }
        u64::try_from(stake / self.dpos.vote_eligibility_balance_step).unwrap_or(u64::MAX)
    }

    fn apply_dpos_call(
        &self,
        inner: &mut StateInner,
        call: DposCall,
        sender: Address,
        value: U256,
        period: PbftPeriod,
    ) -> Result<(), String> {
        match call {
            DposCall::Delegate { validator } => {
                let entry = inner.validators.entry(validator).or_insert(ValidatorEntry {
                    stake: U256::ZERO,
                    vrf_key: VrfPublicKey::ZERO,
                    bls_key: BlsPkBytes::ZERO,
                    jailed_until: 0,
                });
                let new_stake = entry.stake.saturating_add(value);
                if new_stake > self.dpos.validator_maximum_stake {
                    return Err("validator stake over maximum".into());
                }
                entry.stake = new_stake;
                Ok(())
            }
            DposCall::Undelegate { validator, amount } => {
                let entry = inner
                    .validators
                    .get_mut(&validator)
                    .ok_or("unknown validator")?;
                if entry.stake < amount {
                    return Err("undelegate exceeds stake".into());
                }
                entry.stake -= amount;
                inner.accounts.entry(sender).or_default().balance += amount;
                Ok(())
            }
            DposCall::CommitDoubleVotingProof { vote_a, vote_b } => {
                let offender = check_double_voting_proof(&vote_a, &vote_b)?;
                let entry = inner
                    .validators
                    .get_mut(&offender)
                    .ok_or("offender is not a validator")?;
                entry.jailed_until = period + self.jail_time;
                warn!(%offender, until = entry.jailed_until, "validator jailed for double voting");
                Ok(())
            }
        }
    }
}

impl StateApi for InMemoryState {
    fn last_block_number(&self) -> PbftPeriod {
        self.inner.read().executed
    }

    fn account(&self, period: PbftPeriod, address: &Address) -> StateResult<Option<Account>> {
        self.check_period(period)?;
        Ok(self.inner.read().accounts.get(address).copied())
    }

    fn estimate_gas(&self, trx: &Transaction, period: PbftPeriod) -> StateResult<u64> {
        self.check_period(period.min(self.last_block_number()))?;
        Ok(TRANSFER_GAS + trx.input().len() as u64 * INPUT_BYTE_GAS)
    }

    fn dpos_eligible_vote_count(&self, period: PbftPeriod, address: &Address) -> StateResult<u64> {
        self.check_dpos_period(period)?;
        let inner = self.inner.read();
        if let Some(entry) = inner.validators.get(address) {
            if entry.jailed_until >= period && entry.jailed_until != 0 {
                return Ok(0);
            }
        }
        let stakes = self.stakes_at(&inner, period);
        Ok(stakes
            .iter()
            .find(|(addr, _)| addr == address)
            .map(|(_, stake)| self.vote_count_of(*stake))
            .unwrap_or(0))
    }

    fn dpos_eligible_total_vote_count(&self, period: PbftPeriod) -> StateResult<u64> {
        self.check_dpos_period(period)?;
        let inner = self.inner.read();
        let stakes = self.stakes_at(&inner, period);
        Ok(stakes
            .iter()
            .map(|(addr, stake)| {
                let jailed = inner
                    .validators
                    .get(addr)
                    .map(|e| e.jailed_until >= period && e.jailed_until != 0)
                    .unwrap_or(false);
                if jailed {
                    0
                } else {
                    self.vote_count_of(*stake)
                }
            })
            .sum())
    }

    fn dpos_is_eligible(&self, period: PbftPeriod, address: &Address) -> StateResult<bool> {
        Ok(self.dpos_eligible_vote_count(period, address)? > 0)
    }

    fn dpos_vrf_key(
        &self,
        period: PbftPeriod,
        address: &Address,
    ) -> StateResult<Option<VrfPublicKey>> {
        self.check_dpos_period(period)?;
        Ok(self
            .inner
            .read()
            .validators
            .get(address)
            .map(|entry| entry.vrf_key))
    }

    fn dpos_bls_key(
        &self,
        period: PbftPeriod,
        address: &Address,
    ) -> StateResult<Option<BlsPkBytes>> {
        self.check_dpos_period(period)?;
        Ok(self
            .inner
            .read()
            .validators
            .get(address)
            .map(|entry| entry.bls_key))
    }

    fn dpos_validators_stakes(&self, period: PbftPeriod) -> StateResult<Vec<(Address, U256)>> {
        self.check_dpos_period(period)?;
        let inner = self.inner.read();
        Ok(self.stakes_at(&inner, period))
    }

    fn execute_period(&self, input: &FinalizationInput) -> StateResult<ExecutionResult> {
        let mut inner = self.inner.write();
        if input.period != inner.executed + 1 {
            return Err(StateApiError::Execution(format!(
                "non-sequential period: {} after {}",
                input.period, inner.executed
            )));
        }

        let mut receipts = Vec::with_capacity(input.transactions.len());
        let mut fees = U256::ZERO;

        for trx in &input.transactions {
            let receipt = execute_transaction(self, &mut inner, trx, input.period, &mut fees);
            inner.receipts.insert(trx.hash(), receipt.clone());
            receipts.push(receipt);
        }

        // Block rewards: fees plus flat mint to the proposer, flat mint per
        // rewarded cert-voter of the previous period.
        let proposer_reward = fees.saturating_add(U256::from(PROPOSER_REWARD));
        inner.accounts.entry(input.proposer).or_default().balance += proposer_reward;
        for voter in &input.reward_voters {
            inner.accounts.entry(*voter).or_default().balance += U256::from(VOTER_REWARD);
        }

        inner.executed = input.period;
        let snap = snapshot(&inner);
        inner.stake_snapshots.insert(input.period, snap);
        let state_root = root_of(&inner);
        inner.state_roots.insert(input.period, state_root);

        debug!(
            period = input.period,
            trxs = receipts.len(),
            %state_root,
            "executed period"
        );

        Ok(ExecutionResult {
            period: input.period,
            state_root,
            receipts,
            proposer_reward,
        })
    }

    fn state_root(&self, period: PbftPeriod) -> StateResult<B256> {
        self.check_period(period)?;
        Ok(self
            .inner
            .read()
            .state_roots
            .get(&period)
            .copied()
            .unwrap_or(B256::ZERO))
    }
}

fn execute_transaction(
    state: &InMemoryState,
    inner: &mut StateInner,
    trx: &Transaction,
    period: PbftPeriod,
    fees: &mut U256,
) -> TransactionReceipt {
    let failed = TransactionReceipt {
        trx_hash: trx.hash(),
        status_ok: false,
        gas_used: 0,
    };

    let Ok(sender) = trx.sender() else {
        return failed;
    };
    let gas_used = TRANSFER_GAS + trx.input().len() as u64 * INPUT_BYTE_GAS;
    let fee = trx.gas_price().saturating_mul(U256::from(gas_used));

    {
        let account = inner.accounts.entry(sender).or_default();
        if trx.nonce() != account.nonce {
            return failed;
        }
        if account.balance < trx.value().saturating_add(fee) {
            return failed;
        }
        account.balance -= trx.value() + fee;
        account.nonce += 1;
    }
    *fees += fee;

    match trx.to() {
        Some(to) if to == DPOS_CONTRACT_ADDRESS => {
            match abi::parse_call(trx.input()) {
                Some(call) => {
                    if let Err(reason) =
                        state.apply_dpos_call(inner, call, sender, trx.value(), period)
                    {
                        debug!(%sender, reason, "dpos call reverted");
                        // Value is burned on revert; fee stays charged.
                        return TransactionReceipt {
                            trx_hash: trx.hash(),
                            status_ok: false,
                            gas_used,
                        };
                    }
                }
                None => {
                    // Unknown selector: treat as a plain transfer to the
                    // contract address.
                    inner.accounts.entry(to).or_default().balance += trx.value();
                }
            }
        }
        Some(to) => {
            inner.accounts.entry(to).or_default().balance += trx.value();
        }
        // Contract creation is outside this bridge's scope; value burns.
        None => {}
    }

    TransactionReceipt {
        trx_hash: trx.hash(),
        status_ok: true,
        gas_used,
    }
}

/// Validate a double-voting proof and return the offender.
fn check_double_voting_proof(vote_a_rlp: &[u8], vote_b_rlp: &[u8]) -> Result<Address, String> {
    let vote_a = Vote::decode(&mut &vote_a_rlp[..]).map_err(|e| e.to_string())?;
    let vote_b = Vote::decode(&mut &vote_b_rlp[..]).map_err(|e| e.to_string())?;

    let voter_a = vote_a.voter().map_err(|e| e.to_string())?;
    let voter_b = vote_b.voter().map_err(|e| e.to_string())?;
    if voter_a != voter_b {
        return Err("votes from different voters".into());
    }
    let same_coordinates = vote_a.period() == vote_b.period()
        && vote_a.round() == vote_b.round()
        && vote_a.step() == vote_b.step()
        && vote_a.vote_type() == vote_b.vote_type();
    if !same_coordinates {
        return Err("votes target different coordinates".into());
    }
    if vote_a.block_hash() == vote_b.block_hash() {
        return Err("votes agree, nothing to slash".into());
    }
    Ok(voter_a)
}

fn snapshot(inner: &StateInner) -> Vec<(Address, U256)> {
    let mut stakes: Vec<(Address, U256)> = inner
        .validators
        .iter()
        .map(|(addr, entry)| (*addr, entry.stake))
        .collect();
    stakes.sort_by_key(|(addr, _)| *addr);
    stakes
}

fn root_of(inner: &StateInner) -> B256 {
    let mut accounts: Vec<(&Address, &Account)> = inner.accounts.iter().collect();
    accounts.sort_by_key(|(addr, _)| **addr);

    let mut buf = Vec::new();
    for (addr, account) in accounts {
        addr.encode(&mut buf);
        account.balance.encode(&mut buf);
        account.nonce.encode(&mut buf);
    }
    for (addr, stake) in snapshot(inner) {
        addr.encode(&mut buf);
        stake.encode(&mut buf);
    }
    keccak256(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::ecdsa::KeyPair;
    use shared_types::{Bytes, GenesisValidator};

    fn wallet() -> KeyPair {
        KeyPair::from_secret_bytes(&[0x88; 32]).unwrap()
    }

    fn genesis_with_sender() -> GenesisConfig {
        let mut genesis = GenesisConfig::default();
        genesis
            .state
            .initial_balances
            .push((wallet().address(), U256::from(1_000_000_000u64)));
        genesis.validators.push(GenesisValidator {
            address: wallet().address(),
            vrf_key: Address::repeat_byte(0x01),
            bls_key: BlsPkBytes::ZERO,
            stake: U256::from(10_000u64),
        });
        genesis
    }

    fn transfer(nonce: u64, value: u64) -> Transaction {
        Transaction::new(
            nonce,
            U256::from(value),
            U256::from(1u64),
            TRANSFER_GAS,
            Some(Address::repeat_byte(0xEE)),
            Bytes::new(),
            842,
            &wallet(),
        )
        .unwrap()
    }

    fn finalize(period: u64, trxs: Vec<Transaction>) -> FinalizationInput {
        FinalizationInput {
            period,
            anchor: B256::ZERO,
            dag_order: vec![],
            transactions: trxs,
            proposer: Address::repeat_byte(0x99),
            reward_voters: vec![],
        }
    }

    #[test]
    fn test_sequential_transfers_update_nonce_and_balance() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());

        let result = state
            .execute_period(&finalize(1, vec![transfer(0, 100), transfer(1, 100)]))
            .unwrap();

        assert!(result.receipts.iter().all(|r| r.status_ok));
        assert_eq!(state.nonce(1, &wallet().address()).unwrap(), 2);
        assert_eq!(
            state.balance(1, &Address::repeat_byte(0xEE)).unwrap(),
            U256::from(200u64)
        );
        // Fees landed on the proposer (plus the flat mint).
        assert!(
            state.balance(1, &Address::repeat_byte(0x99)).unwrap()
                > U256::from(2 * TRANSFER_GAS as u64)
        );
    }

    #[test]
    fn test_nonce_gap_fails_receipt() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());
        let result = state
            .execute_period(&finalize(1, vec![transfer(5, 100)]))
            .unwrap();
        assert!(!result.receipts[0].status_ok);
        assert_eq!(state.nonce(1, &wallet().address()).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_nonce_executes_once() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());
        let result = state
            .execute_period(&finalize(1, vec![transfer(0, 100), transfer(0, 100)]))
            .unwrap();
        assert!(result.receipts[0].status_ok);
        assert!(!result.receipts[1].status_ok);
        assert_eq!(state.nonce(1, &wallet().address()).unwrap(), 1);
    }

    #[test]
    fn test_future_period_query_rejected() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());
        match state.balance(3, &wallet().address()) {
            Err(StateApiError::FutureBlock { requested, last }) => {
                assert_eq!(requested, 3);
                assert_eq!(last, 0);
            }
            other => panic!("expected FutureBlock, got {other:?}"),
        }
    }

    #[test]
    fn test_non_sequential_execution_rejected() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());
        assert!(state.execute_period(&finalize(2, vec![])).is_err());
    }

    #[test]
    fn test_vote_counts_follow_stake_steps() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());
        // 10_000 stake at step 1_000 → 10 votes.
        assert_eq!(
            state
                .dpos_eligible_vote_count(0, &wallet().address())
                .unwrap(),
            10
        );
        assert_eq!(state.dpos_eligible_total_vote_count(0).unwrap(), 10);
        assert!(state.dpos_is_eligible(0, &wallet().address()).unwrap());
    }

    #[test]
    fn test_double_voting_proof_jails_offender() {
        use shared_crypto::vrf::VrfKeyPair;
        use shared_types::{Vote, VoteType};

        let state = InMemoryState::from_genesis(&genesis_with_sender());
        let vrf = VrfKeyPair::generate();
        let proof = vrf.prove(&Vote::sortition_message(1, 1, 3)).unwrap();
        let vote_a =
            Vote::new(B256::repeat_byte(0x01), VoteType::Cert, 1, 1, 3, &proof, &wallet()).unwrap();
        let vote_b =
            Vote::new(B256::repeat_byte(0x02), VoteType::Cert, 1, 1, 3, &proof, &wallet()).unwrap();

        let call = abi::commit_double_voting_proof(
            &alloy_rlp::encode(&vote_a),
            &alloy_rlp::encode(&vote_b),
        );
        let proof_trx = Transaction::new(
            0,
            U256::ZERO,
            U256::from(1u64),
            1_000_000,
            Some(DPOS_CONTRACT_ADDRESS),
            call,
            842,
            &wallet(),
        )
        .unwrap();

        let result = state.execute_period(&finalize(1, vec![proof_trx])).unwrap();
        assert!(result.receipts[0].status_ok);
        assert!(!state.dpos_is_eligible(1, &wallet().address()).unwrap());
        assert_eq!(state.dpos_eligible_total_vote_count(1).unwrap(), 0);
    }

    #[test]
    fn test_state_root_changes_with_state() {
        let state = InMemoryState::from_genesis(&genesis_with_sender());
        let root0 = state.state_root(0).unwrap();
        state
            .execute_period(&finalize(1, vec![transfer(0, 100)]))
            .unwrap();
        assert_ne!(state.state_root(1).unwrap(), root0);
    }
}
