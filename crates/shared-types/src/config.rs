//! Protocol configuration.
//!
//! Everything under `GenesisConfig` is consensus-critical: two nodes with
//! different genesis configs compute different genesis hashes and will not
//! peer. Node-local settings (ports, data dir, wallet) live in the runtime
//! crate.

use crate::{dag_block::DagBlock, primitives::*};
use serde::{Deserialize, Serialize};
use shared_crypto::vdf::VdfParams;

/// DAG layer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Gas budget of a single DAG block.
    pub gas_limit: u64,
    /// Maximum number of tips a block may reference.
    pub max_tips: usize,
    /// Levels below `anchor_level - dag_expiry_limit` are expired.
    pub dag_expiry_limit: u64,
    /// Upper bound on DAG levels finalized by one period.
    pub max_levels_per_period: u64,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            gas_limit: 10_000_000,
            max_tips: 16,
            dag_expiry_limit: 1000,
            max_levels_per_period: 100,
        }
    }
}

/// PBFT timing and quorum parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbftConfig {
    /// Nominal step duration in milliseconds.
    pub lambda_ms: u64,
    /// Gas budget of one finalized period.
    pub gas_limit: u64,
    /// Expected committee size for vote sortition.
    pub committee_size: u64,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            lambda_ms: 1500,
            gas_limit: 60_000_000,
            committee_size: 1000,
        }
    }
}

/// Serializable mirror of the VDF sortition parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortitionConfig {
    pub difficulty_min: u16,
    pub difficulty_max: u16,
    pub difficulty_stale: u16,
    pub lambda_bound_ms: u64,
    pub vrf_selection: u64,
}

impl Default for SortitionConfig {
    fn default() -> Self {
        let params = VdfParams::default();
        Self {
            difficulty_min: params.difficulty_min,
            difficulty_max: params.difficulty_max,
            difficulty_stale: params.difficulty_stale,
            lambda_bound_ms: params.lambda_bound_ms,
            vrf_selection: params.vrf_selection,
        }
    }
}

impl From<&SortitionConfig> for VdfParams {
    fn from(config: &SortitionConfig) -> Self {
        Self {
            difficulty_min: config.difficulty_min,
            difficulty_max: config.difficulty_max,
            difficulty_stale: config.difficulty_stale,
            lambda_bound_ms: config.lambda_bound_ms,
            vrf_selection: config.vrf_selection,
        }
    }
}

/// Ficus hardfork: activates the pillar chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FicusHardfork {
    /// First period at which pillar blocks are produced.
    pub block_num: u64,
    /// Pillar block cadence in periods.
    pub pillar_blocks_interval: u64,
}

impl Default for FicusHardfork {
    fn default() -> Self {
        Self {
            block_num: 0,
            pillar_blocks_interval: 16,
        }
    }
}

impl FicusHardfork {
    /// Whether `period` produces a pillar block.
    pub fn is_pillar_block_period(&self, period: PbftPeriod) -> bool {
        period >= self.block_num
            && self.pillar_blocks_interval != 0
            && period % self.pillar_blocks_interval == 0
            && period > 0
    }
}

/// Magnolia hardfork: jailing for double-voting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnoliaHardfork {
    pub block_num: u64,
    /// Periods a convicted double-voter stays jailed.
    pub jail_time: u64,
}

impl Default for MagnoliaHardfork {
    fn default() -> Self {
        Self {
            block_num: 0,
            jail_time: 163_459,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardforksConfig {
    pub ficus: FicusHardfork,
    pub magnolia: MagnoliaHardfork,
}

/// DPoS stake arithmetic parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DposConfig {
    /// Minimum delegation to be considered at all.
    pub eligibility_balance_threshold: U256,
    /// Stake per eligible vote.
    pub vote_eligibility_balance_step: U256,
    /// Cap on a single validator's stake.
    pub validator_maximum_stake: U256,
    /// Periods before a new delegation becomes active.
    pub delegation_delay: u64,
}

impl Default for DposConfig {
    fn default() -> Self {
        Self {
            eligibility_balance_threshold: U256::from(1_000u64),
            vote_eligibility_balance_step: U256::from(1_000u64),
            validator_maximum_stake: U256::from(10_000_000u64),
            delegation_delay: 2,
        }
    }
}

/// Initial world state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    pub initial_balances: Vec<(Address, U256)>,
    pub dpos: DposConfig,
}

/// One validator registered at genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    /// Registered VRF key commitment.
    pub vrf_key: Address,
    /// Registered BLS public key for pillar votes.
    pub bls_key: BlsPkBytes,
    pub stake: U256,
}

/// The consensus-critical genesis document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub dag_genesis_block: DagBlock,
    pub validators: Vec<GenesisValidator>,
    pub state: StateConfig,
    pub dag: DagConfig,
    pub pbft: PbftConfig,
    pub sortition: SortitionConfig,
    pub hardforks: HardforksConfig,
    /// Per-transaction gas cap enforced by the pool.
    pub max_transaction_gas: u64,
    /// Minimum gas price accepted anywhere.
    pub minimum_gas_price: U256,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        // A throwaway deterministic key signs the default genesis block;
        // real deployments ship a pre-signed block in the config file.
        let keypair = shared_crypto::ecdsa::KeyPair::from_secret_bytes(&[0x01; 32])
            .expect("static key is valid");
        Self {
            chain_id: 842,
            dag_genesis_block: DagBlock::genesis(1_700_000_000, &keypair)
                .expect("genesis construction cannot fail"),
            validators: vec![],
            state: StateConfig::default(),
            dag: DagConfig::default(),
            pbft: PbftConfig::default(),
            sortition: SortitionConfig::default(),
            hardforks: HardforksConfig::default(),
            max_transaction_gas: 31_500_000,
            minimum_gas_price: U256::from(1u64),
        }
    }
}

impl GenesisConfig {
    pub fn vdf_params(&self) -> VdfParams {
        VdfParams::from(&self.sortition)
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.dag_genesis_block.hash()
    }
}

/// The honest quorum: for `n` total vote weight, `2t+1 = floor((2n+2)/3)`.
pub fn two_t_plus_one(total_weight: u64) -> u64 {
    (2 * total_weight + 2) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_t_plus_one_small_sets() {
        assert_eq!(two_t_plus_one(1), 1);
        assert_eq!(two_t_plus_one(2), 2);
        assert_eq!(two_t_plus_one(3), 2);
        assert_eq!(two_t_plus_one(4), 3);
        assert_eq!(two_t_plus_one(6), 4);
        assert_eq!(two_t_plus_one(100), 67);
    }

    #[test]
    fn test_pillar_period_cadence() {
        let hf = FicusHardfork {
            block_num: 4,
            pillar_blocks_interval: 4,
        };
        assert!(!hf.is_pillar_block_period(0));
        assert!(!hf.is_pillar_block_period(2));
        assert!(hf.is_pillar_block_period(4));
        assert!(!hf.is_pillar_block_period(5));
        assert!(hf.is_pillar_block_period(8));
    }

    #[test]
    fn test_genesis_json_roundtrip() {
        let config = GenesisConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: GenesisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.genesis_hash(), back.genesis_hash());
        assert_eq!(config.chain_id, back.chain_id);
    }

    #[test]
    fn test_default_genesis_block_verifies() {
        let config = GenesisConfig::default();
        assert!(config.dag_genesis_block.verify_sig());
        assert_eq!(config.dag_genesis_block.level(), 0);
    }
}
