//! Test fixtures: fully wired nodes over a loopback transport.

use hx_block_proposer::BlockProposer;
use hx_dag::{DagManager, SortitionParamsManager};
use hx_final_chain::InMemoryState;
use hx_network::{DisconnectReason, Network, NetworkConfig, PacketSender, PacketType};
use hx_pbft::{PbftChain, PbftManager, PeriodDataQueue, SlashingManager, VoteManager};
use hx_pillar_chain::PillarChainManager;
use hx_storage::DbStorage;
use hx_transaction_pool::{PoolConfig, TransactionPool};
use parking_lot::RwLock;
use shared_bus::EventBus;
use shared_crypto::bls::PillarBlsKeys;
use shared_crypto::ecdsa::KeyPair;
use shared_crypto::hashing::keccak256;
use shared_crypto::vrf::VrfKeyPair;
use shared_types::{
    BlsPkBytes, GenesisConfig, GenesisValidator, NodeId, SortitionConfig, U256,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Routes packets between in-process networks.
#[derive(Default)]
pub struct Router {
    networks: RwLock<HashMap<NodeId, Arc<Network>>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, node_id: NodeId, network: Arc<Network>) {
        self.networks.write().insert(node_id, network);
    }

    fn get(&self, node_id: &NodeId) -> Option<Arc<Network>> {
        self.networks.read().get(node_id).cloned()
    }
}

/// The outbound half of one node, delivering into the router.
pub struct Loopback {
    pub self_id: NodeId,
    pub router: Arc<Router>,
}

impl PacketSender for Loopback {
    fn send_packet(&self, to: &NodeId, packet_type: PacketType, payload: Vec<u8>) -> bool {
        match self.router.get(to) {
            Some(network) => {
                network.receive_packet(self.self_id, packet_type as u8, payload);
                true
            }
            None => false,
        }
    }

    fn disconnect(&self, peer: &NodeId, _reason: DisconnectReason) {
        if let Some(network) = self.router.get(peer) {
            network.on_peer_disconnected(&self.self_id);
        }
    }
}

pub struct TestNode {
    pub _dir: TempDir,
    pub node_id: NodeId,
    pub keys: Arc<KeyPair>,
    pub vrf_keys: Arc<VrfKeyPair>,
    pub db: Arc<DbStorage>,
    pub state: Arc<InMemoryState>,
    pub pool: Arc<TransactionPool>,
    pub dag: Arc<DagManager>,
    pub chain: Arc<PbftChain>,
    pub vote_mgr: Arc<VoteManager>,
    pub pillar: Arc<PillarChainManager>,
    pub pbft: Arc<PbftManager>,
    pub proposer: Arc<BlockProposer>,
    pub network: Arc<Network>,
}

/// Validator spec for [`test_genesis`].
pub struct TestValidator {
    pub secret: u8,
    pub stake: u64,
}

/// Deterministic keys for one validator slot.
pub fn validator_keys(secret: u8) -> (Arc<KeyPair>, Arc<VrfKeyPair>, Arc<PillarBlsKeys>) {
    let keys = Arc::new(KeyPair::from_secret_bytes(&[secret; 32]).unwrap());
    let vrf = Arc::new(VrfKeyPair::from_secret_bytes(&[secret.wrapping_add(1); 32]).unwrap());
    let mut bls_seed = [secret; 32];
    bls_seed[0] = bls_seed[0].wrapping_add(2);
    let bls = Arc::new(PillarBlsKeys::from_secret_bytes(&bls_seed).unwrap());
    (keys, vrf, bls)
}

/// A genesis with the given validators, cheap VDFs and fast lambdas.
pub fn test_genesis(validators: &[TestValidator]) -> GenesisConfig {
    let mut genesis = GenesisConfig::default();
    genesis.pbft.lambda_ms = 30;
    genesis.sortition = SortitionConfig {
        difficulty_min: 1,
        difficulty_max: 2,
        difficulty_stale: 3,
        lambda_bound_ms: 1500,
        vrf_selection: 10_000,
    };
    for validator in validators {
        let (keys, vrf, bls) = validator_keys(validator.secret);
        genesis.validators.push(GenesisValidator {
            address: keys.address(),
            vrf_key: vrf.public_key(),
            bls_key: BlsPkBytes::from(bls.public_key().to_bytes()),
            stake: U256::from(validator.stake),
        });
        genesis
            .state
            .initial_balances
            .push((keys.address(), U256::from(1_000_000_000u64)));
    }
    genesis
}

/// Build one fully wired node on the router.
pub fn build_node(secret: u8, genesis: &GenesisConfig, router: &Arc<Router>) -> TestNode {
    let (keys, vrf_keys, bls_keys) = validator_keys(secret);
    let node_id = keccak256(keys.address());

    let dir = TempDir::new().unwrap();
    let db = Arc::new(DbStorage::open(dir.path()).unwrap());
    let state = Arc::new(InMemoryState::from_genesis(genesis));
    let bus = Arc::new(EventBus::new());
    let pool = Arc::new(TransactionPool::new(
        PoolConfig {
            chain_id: genesis.chain_id,
            ..PoolConfig::default()
        },
        state.clone(),
        db.clone(),
        bus.clone(),
    ));
    let dag = DagManager::new(
        genesis.dag_genesis_block.clone(),
        genesis.dag.clone(),
        genesis.pbft.gas_limit,
        SortitionParamsManager::new(genesis.sortition.clone(), db.clone()),
        db.clone(),
        pool.clone(),
        state.clone(),
        bus.clone(),
    )
    .unwrap();
    let chain = Arc::new(PbftChain::new(db.clone()).unwrap());
    let vote_mgr = Arc::new(VoteManager::new(
        keys.clone(),
        vrf_keys.clone(),
        genesis.pbft.committee_size,
        state.clone(),
    ));
    let pillar = PillarChainManager::new(
        genesis.hardforks.ficus.clone(),
        keys.address(),
        bls_keys,
        db.clone(),
        state.clone(),
        bus.clone(),
    )
    .unwrap();
    let slashing = Arc::new(SlashingManager::new(
        keys.clone(),
        genesis.chain_id,
        pool.clone(),
        state.clone(),
        bus.clone(),
    ));
    let pbft = PbftManager::new(
        genesis.pbft.clone(),
        keys.clone(),
        chain.clone(),
        vote_mgr.clone(),
        dag.clone(),
        pool.clone(),
        state.clone(),
        db.clone(),
        bus,
        pillar.clone(),
        slashing,
        Arc::new(PeriodDataQueue::new()),
    );
    let proposer = BlockProposer::new(
        keys.clone(),
        vrf_keys.clone(),
        genesis.dag.gas_limit,
        SortitionParamsManager::new(genesis.sortition.clone(), db.clone()),
        dag.clone(),
        pool.clone(),
        state.clone(),
        db.clone(),
    );
    let network = Network::new(
        NetworkConfig {
            chain_id: genesis.chain_id,
            packet_workers: 4,
            ..NetworkConfig::default()
        },
        genesis.genesis_hash(),
        dag.clone(),
        pool.clone(),
        chain.clone(),
        vote_mgr.clone(),
        pbft.clone(),
        pillar.clone(),
        db.clone(),
    );
    dag.set_network(network.clone());
    pbft.set_network(network.clone());
    pillar.set_network(network.clone());

    router.register(node_id, network.clone());
    network.start(Arc::new(Loopback {
        self_id: node_id,
        router: router.clone(),
    }));

    TestNode {
        _dir: dir,
        node_id,
        keys,
        vrf_keys,
        db,
        state,
        pool,
        dag,
        chain,
        vote_mgr,
        pillar,
        pbft,
        proposer,
        network,
    }
}

/// Open sessions both ways (each side sends its initial status).
pub fn connect(a: &TestNode, b: &TestNode) {
    a.network.on_peer_connected(b.node_id);
    b.network.on_peer_connected(a.node_id);
}

/// Drive the PBFT machines of `nodes` until `until` holds.
pub fn drive_until(nodes: &[&TestNode], max_iterations: usize, until: impl Fn() -> bool) {
    for _ in 0..max_iterations {
        if until() {
            return;
        }
        for node in nodes {
            node.pbft.step_once();
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached within {max_iterations} iterations");
}

/// Spin until `predicate` holds (for asynchronous packet processing).
pub fn wait_until(max: Duration, predicate: impl Fn() -> bool) {
    let started = std::time::Instant::now();
    while started.elapsed() < max {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within {max:?}");
}
