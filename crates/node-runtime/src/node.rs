//! Node assembly and lifecycle.
//!
//! Construction order follows the dependency graph: storage → state
//! (replayed from persisted periods) → pool → DAG → PBFT chain/votes →
//! pillar → slashing → PBFT manager → proposer → network. The network is
//! built last and injected into the managers through their `set_network`
//! ports. Shutdown runs the same order in reverse.

use crate::{config::NodeConfig, transport::TcpTransport};
use anyhow::{bail, Context, Result};
use hx_block_proposer::BlockProposer;
use hx_dag::{DagManager, SortitionParamsManager};
use hx_final_chain::{FinalizationInput, InMemoryState, StateApi};
use hx_network::{Network, NetworkConfig};
use hx_pbft::{PbftChain, PbftManager, PeriodDataQueue, SlashingManager, VoteManager};
use hx_pillar_chain::PillarChainManager;
use hx_storage::{migration, DbStorage};
use hx_transaction_pool::{PoolConfig, TransactionPool};
use parking_lot::Mutex;
use shared_bus::EventBus;
use shared_crypto::bls::PillarBlsKeys;
use shared_crypto::ecdsa::KeyPair;
use shared_crypto::hashing::keccak256;
use shared_crypto::vrf::VrfKeyPair;
use shared_types::{NodeId, TrxHash};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Node {
    pub config: NodeConfig,
    pub node_id: NodeId,
    pub db: Arc<DbStorage>,
    pub state: Arc<InMemoryState>,
    pub bus: Arc<EventBus>,
    pub pool: Arc<TransactionPool>,
    pub dag: Arc<DagManager>,
    pub chain: Arc<PbftChain>,
    pub vote_mgr: Arc<VoteManager>,
    pub pillar: Arc<PillarChainManager>,
    pub pbft: Arc<PbftManager>,
    pub proposer: Arc<BlockProposer>,
    pub network: Arc<Network>,
    pub transport: Arc<TcpTransport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn build(config: NodeConfig) -> Result<Arc<Self>> {
        // Keys first: identity decides everything downstream.
        let node_keys = match NodeConfig::secret_bytes(&config.node_secret)? {
            Some(secret) => Arc::new(KeyPair::from_secret_bytes(&secret)?),
            None => Arc::new(KeyPair::generate()),
        };
        let vrf_keys = match NodeConfig::secret_bytes(&config.vrf_secret)? {
            Some(secret) => Arc::new(VrfKeyPair::from_secret_bytes(&secret)?),
            None => Arc::new(VrfKeyPair::generate()),
        };
        let bls_keys = match NodeConfig::secret_bytes(&config.bls_secret)? {
            Some(secret) => Arc::new(PillarBlsKeys::from_secret_bytes(&secret)?),
            None => Arc::new(PillarBlsKeys::generate()),
        };
        let node_address = node_keys.address();
        let node_id = keccak256(node_address);
        info!(%node_address, %node_id, "node identity");

        // Genesis must verify before anything touches disk.
        if !config.genesis.dag_genesis_block.verify_sig() {
            bail!("genesis dag block signature does not verify");
        }
        let genesis_hash = config.genesis.genesis_hash();

        let db_path = std::path::Path::new(&config.data_dir).join("db");
        std::fs::create_dir_all(&config.data_dir).context("creating data dir")?;
        Self::rebuild_database_if_needed(&db_path, &config)?;
        let db = Arc::new(DbStorage::open(&db_path)?);

        // Genesis marker: a mismatch means this data dir belongs to a
        // different chain — refusing to run is the only safe answer.
        match db.genesis_hash()? {
            Some(stored) if stored != genesis_hash => {
                bail!("database genesis {stored} does not match config genesis {genesis_hash}");
            }
            Some(_) => {}
            None => {
                db.set_genesis_hash(&genesis_hash)?;
                db.set_major_version(hx_storage::DB_MAJOR_VERSION)?;
            }
        }

        // State is in-memory: replay every persisted period through it.
        let state = Arc::new(InMemoryState::from_genesis(&config.genesis));
        replay_persisted_periods(&db, &state)?;

        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(TransactionPool::new(
            PoolConfig {
                chain_id: config.genesis.chain_id,
                max_transaction_gas: config.genesis.max_transaction_gas,
                minimum_gas_price: config.genesis.minimum_gas_price,
                ..PoolConfig::default()
            },
            state.clone(),
            db.clone(),
            bus.clone(),
        ));

        let dag = DagManager::new(
            config.genesis.dag_genesis_block.clone(),
            config.genesis.dag.clone(),
            config.genesis.pbft.gas_limit,
            SortitionParamsManager::new(config.genesis.sortition.clone(), db.clone()),
            db.clone(),
            pool.clone(),
            state.clone(),
            bus.clone(),
        )?;
        if config.is_light_node {
            dag.clear_light_node_history(config.light_node_history)?;
        }

        let chain = Arc::new(PbftChain::new(db.clone())?);
        let vote_mgr = Arc::new(VoteManager::new(
            node_keys.clone(),
            vrf_keys.clone(),
            config.genesis.pbft.committee_size,
            state.clone(),
        ));
        let pillar = PillarChainManager::new(
            config.genesis.hardforks.ficus.clone(),
            node_address,
            bls_keys,
            db.clone(),
            state.clone(),
            bus.clone(),
        )?;
        let slashing = Arc::new(SlashingManager::new(
            node_keys.clone(),
            config.genesis.chain_id,
            pool.clone(),
            state.clone(),
            bus.clone(),
        ));
        let pbft = PbftManager::new(
            config.genesis.pbft.clone(),
            node_keys.clone(),
            chain.clone(),
            vote_mgr.clone(),
            dag.clone(),
            pool.clone(),
            state.clone(),
            db.clone(),
            bus.clone(),
            pillar.clone(),
            slashing,
            Arc::new(PeriodDataQueue::new()),
        );
        let proposer = BlockProposer::new(
            node_keys,
            vrf_keys,
            config.genesis.dag.gas_limit,
            SortitionParamsManager::new(config.genesis.sortition.clone(), db.clone()),
            dag.clone(),
            pool.clone(),
            state.clone(),
            db.clone(),
        );

        // Network last; managers learn about it through their ports.
        let network = Network::new(
            NetworkConfig {
                network_id: config.network_id,
                chain_id: config.genesis.chain_id,
                packet_workers: config.packet_workers,
                is_light_node: config.is_light_node,
                light_node_history: config.light_node_history,
                sync_level_size: config.network_sync_level_size,
                node_version: (0, 1, 0),
            },
            genesis_hash,
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

        let transport = TcpTransport::new(node_id, network.clone());
        network.start(transport.clone());

        Ok(Arc::new(Self {
            config,
            node_id,
            db,
            state,
            bus,
            pool,
            dag,
            chain,
            vote_mgr,
            pillar,
            pbft,
            proposer,
            network,
            transport,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Major-version bump: replay the old database into a fresh one.
    fn rebuild_database_if_needed(
        db_path: &std::path::Path,
        config: &NodeConfig,
    ) -> Result<()> {
        if !db_path.exists() {
            return Ok(());
        }
        let needs = {
            let db = DbStorage::open(db_path)?;
            migration::needs_rebuild(&db)?
        };
        if !needs {
            return Ok(());
        }

        info!("database major version changed, rebuilding");
        let fresh_path = db_path.with_extension("rebuild");
        if fresh_path.exists() {
            std::fs::remove_dir_all(&fresh_path)?;
        }
        {
            let old = DbStorage::open_read_only(db_path)?;
            let fresh = DbStorage::open(&fresh_path)?;
            let replay_state = InMemoryState::from_genesis(&config.genesis);
            migration::rebuild(&old, &fresh, |data, _batch| {
                execute_period_data(&replay_state, data).map_err(|e| {
                    hx_storage::StorageError::Corrupt {
                        column: "period_data",
                        reason: e.to_string(),
                    }
                })
            })?;
        }
        let backup = db_path.with_extension("old");
        if backup.exists() {
            std::fs::remove_dir_all(&backup)?;
        }
        std::fs::rename(db_path, &backup)?;
        std::fs::rename(&fresh_path, db_path)?;
        info!("database rebuild finished");
        Ok(())
    }

    /// Spawn the long-running tasks.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let transport = self.transport.clone();
        let port = self.config.listen_port;
        tasks.push(tokio::spawn(async move {
            if let Err(err) = transport.listen(port).await {
                warn!(%err, "listener terminated");
            }
        }));
        for addr in self.config.boot_nodes.clone() {
            let transport = self.transport.clone();
            tasks.push(tokio::spawn(async move {
                transport.connect(addr).await;
            }));
        }

        tasks.push(tokio::spawn(self.pbft.clone().run()));
        tasks.push(tokio::spawn(self.proposer.clone().run()));

        // Periodic maintenance: status refresh, sync checks, stats, and
        // batched transaction gossip.
        let node = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut gossiped: HashSet<TrxHash> = HashSet::new();
            let mut tick = 0u64;
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let pending = node.pool.get_pool_transactions();
                let fresh: Vec<_> = pending
                    .into_iter()
                    .filter(|trx| gossiped.insert(trx.hash()))
                    .collect();
                if !fresh.is_empty() {
                    node.network.gossip_transactions(&fresh);
                }
                if gossiped.len() > 100_000 {
                    gossiped.clear();
                }
                tick += 1;
                if tick % 10 == 0 {
                    node.network.periodic();
                    if node.config.is_light_node {
                        if let Err(err) =
                            node.dag.clear_light_node_history(node.config.light_node_history)
                        {
                            warn!(%err, "light-node pruning failed");
                        }
                    }
                }
            }
        }));

        info!("node started");
    }

    /// Ordered shutdown: proposer, PBFT, packet workers, transport, tasks.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.proposer.stop();
        self.pbft.stop();
        self.network.stop();
        self.transport.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // The database flushes on drop.
        info!("shutdown complete");
    }
}

/// Replay every persisted period through a fresh state instance.
fn replay_persisted_periods(db: &DbStorage, state: &InMemoryState) -> Result<()> {
    let Some(head) = db.pbft_head()? else {
        return Ok(());
    };
    for period in 1..=head.period {
        let Some(data) = db.period_data(period)? else {
            // Pruned light-node history below this point.
            continue;
        };
        execute_period_data(state, &data)
            .with_context(|| format!("replaying period {period}"))?;
    }
    info!(period = head.period, "state replayed");
    Ok(())
}

fn execute_period_data(
    state: &InMemoryState,
    data: &shared_types::PeriodData,
) -> Result<()> {
    let block = &data.pbft_block;
    let reward_voters = data
        .previous_block_cert_votes
        .iter()
        .filter_map(|vote| vote.voter().ok())
        .collect();
    state
        .execute_period(&FinalizationInput {
            period: block.period(),
            anchor: block.pivot_dag_block_hash(),
            dag_order: data.dag_blocks.iter().map(|b| b.hash()).collect(),
            transactions: data.transactions.clone(),
            proposer: block.proposer().unwrap_or_default(),
            reward_voters,
        })
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("execution failed: {err}"))
}
