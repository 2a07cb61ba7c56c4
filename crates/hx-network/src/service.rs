//! The capability service.
//!
//! Ties the peer table, the packet threadpool and the component managers
//! together: validates handshakes, dispatches packets to handlers,
//! applies the disconnect policy of [`PacketError`], serves sync
//! requests, and implements the gossip ports the managers call back into.

use crate::{
    messages::*,
    packet::{PacketData, PacketType, MAX_PACKET_SIZE},
    peer::{DisconnectReason, Peer, PeersState},
    stats::PacketsStats,
    threadpool::{PacketProcessor, PacketsThreadPool, MAX_QUEUE_SIZE_TO_DROP_SYNCING},
    PacketError, PacketSender, TARCAP_VERSION,
};
use alloy_rlp::Decodable;
use hx_dag::{DagBlockGossiper, DagError, DagManager, VerifyBlockStatus};
use hx_pbft::{ConsensusGossiper, PbftChain, PbftManager, VoteError, VoteManager};
use hx_pillar_chain::{PillarChainManager, PillarVoteGossiper};
use hx_storage::DbStorage;
use hx_transaction_pool::{InsertError, TransactionPool};
use parking_lot::{Mutex, RwLock};
use shared_types::{DagBlock, NodeId, PbftBlock, PillarVote, Transaction, Vote, VoteType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network_id: u64,
    pub chain_id: u64,
    pub packet_workers: usize,
    pub is_light_node: bool,
    pub light_node_history: u64,
    /// Periods served per PBFT sync window.
    pub sync_level_size: u64,
    pub node_version: (u16, u16, u16),
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            chain_id: 842,
            packet_workers: 10,
            is_light_node: false,
            light_node_history: 100,
            sync_level_size: 10,
            node_version: (0, 1, 0),
        }
    }
}

pub struct Network {
    config: NetworkConfig,
    genesis_hash: shared_types::B256,
    peers: PeersState,
    threadpool: PacketsThreadPool,
    stats: PacketsStats,
    sender: RwLock<Option<Arc<dyn PacketSender>>>,

    dag: Arc<DagManager>,
    pool: Arc<TransactionPool>,
    chain: Arc<PbftChain>,
    vote_mgr: Arc<VoteManager>,
    pbft: Arc<PbftManager>,
    pillar: Arc<PillarChainManager>,
    db: Arc<DbStorage>,

    syncing_peer: Mutex<Option<NodeId>>,
}

impl Network {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NetworkConfig,
        genesis_hash: shared_types::B256,
        dag: Arc<DagManager>,
        pool: Arc<TransactionPool>,
        chain: Arc<PbftChain>,
        vote_mgr: Arc<VoteManager>,
        pbft: Arc<PbftManager>,
        pillar: Arc<PillarChainManager>,
        db: Arc<DbStorage>,
    ) -> Arc<Self> {
        let threadpool = PacketsThreadPool::new(config.packet_workers);
        Arc::new(Self {
            config,
            genesis_hash,
            peers: PeersState::new(),
            threadpool,
            stats: PacketsStats::new(),
            sender: RwLock::new(None),
            dag,
            pool,
            chain,
            vote_mgr,
            pbft,
            pillar,
            db,
            syncing_peer: Mutex::new(None),
        })
    }

    /// Wire the outbound transport and spin up the workers.
    pub fn start(self: &Arc<Self>, sender: Arc<dyn PacketSender>) {
        *self.sender.write() = Some(sender);
        self.threadpool.start(Arc::new(Dispatcher(self.clone())));
    }

    pub fn stop(&self) {
        self.threadpool.stop();
    }

    pub fn peers_state(&self) -> &PeersState {
        &self.peers
    }

    pub fn stats(&self) -> &PacketsStats {
        &self.stats
    }

    pub fn is_pbft_syncing(&self) -> bool {
        self.syncing_peer.lock().is_some()
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// A transport session came up: track it and send our initial status.
    pub fn on_peer_connected(&self, node_id: NodeId) {
        if self.peers.is_malicious(&node_id) {
            debug!(peer = %node_id, "refusing connection from banned peer");
            self.disconnect(&node_id, DisconnectReason::UserReason);
            return;
        }
        self.peers.register_pending(node_id);
        self.send_initial_status(&node_id);
    }

    pub fn on_peer_disconnected(&self, node_id: &NodeId) {
        let mut syncing = self.syncing_peer.lock();
        if *syncing == Some(*node_id) {
            *syncing = None;
        }
        drop(syncing);
        self.peers.remove(node_id);
    }

    /// Inbound bytes from the transport; queued for the worker pool.
    pub fn receive_packet(&self, from: NodeId, type_byte: u8, payload: Vec<u8>) {
        if payload.len() > MAX_PACKET_SIZE {
            warn!(peer = %from, size = payload.len(), "oversized packet");
            self.punish(&from, DisconnectReason::BadProtocol, false);
            return;
        }
        let Some(packet_type) = PacketType::from_u8(type_byte) else {
            self.punish(&from, DisconnectReason::BadProtocol, false);
            return;
        };
        self.threadpool
            .push(PacketData::new(from, packet_type, payload));
    }

    fn process_packet(&self, packet: PacketData) {
        let queueing = packet.received_at.elapsed();
        let started = Instant::now();
        let result = self.dispatch(&packet);
        self.stats
            .record(packet.packet_type, queueing, started.elapsed());

        if let Some(peer) = self.peers.get_any(&packet.from) {
            peer.received_packets
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        match result {
            Ok(()) => {}
            Err(PacketError::Malformed(reason)) => {
                warn!(peer = %packet.from, packet_type = ?packet.packet_type, reason, "malformed packet");
                self.punish(&packet.from, DisconnectReason::BadProtocol, false);
            }
            Err(PacketError::MaliciousPeer(reason)) => {
                warn!(peer = %packet.from, packet_type = ?packet.packet_type, reason, "malicious packet");
                self.punish(&packet.from, DisconnectReason::UserReason, true);
            }
            Err(PacketError::StaleInput) => {
                trace!(peer = %packet.from, packet_type = ?packet.packet_type, "stale input dropped");
            }
            Err(PacketError::Transient(reason)) => {
                debug!(peer = %packet.from, packet_type = ?packet.packet_type, reason, "transient drop");
                // Repeated unprocessable packets count toward the
                // suspicious rate.
                if let Some(peer) = self.peers.get_any(&packet.from) {
                    if peer.report_suspicious_packet() {
                        self.punish(&packet.from, DisconnectReason::UserReason, true);
                    }
                }
            }
        }
    }

    fn dispatch(&self, packet: &PacketData) -> Result<(), PacketError> {
        // Everything except the handshake requires a promoted peer.
        if packet.packet_type != PacketType::Status
            && self.peers.get(&packet.from).is_none()
        {
            return Err(PacketError::Transient("peer not handshaken".into()));
        }
        match packet.packet_type {
            PacketType::Status => self.handle_status(packet),
            PacketType::DagBlock => self.handle_dag_block(packet),
            PacketType::Transactions => self.handle_transactions(packet),
            PacketType::Vote => self.handle_vote(packet),
            PacketType::VotesBundle => self.handle_votes_bundle(packet),
            PacketType::GetNextVotesSync => self.handle_get_next_votes_sync(packet),
            PacketType::GetDagSync => self.handle_get_dag_sync(packet),
            PacketType::DagSync => self.handle_dag_sync(packet),
            PacketType::GetPbftSync => self.handle_get_pbft_sync(packet),
            PacketType::PbftSync => self.handle_pbft_sync(packet),
            PacketType::PillarVote => self.handle_pillar_vote(packet),
            PacketType::GetPillarVotesBundle => self.handle_get_pillar_votes_bundle(packet),
            PacketType::PillarVotesBundle => self.handle_pillar_votes_bundle(packet),
        }
    }

    // =========================================================================
    // Handshake & status
    // =========================================================================

    fn send_initial_status(&self, to: &NodeId) {
        let (major, minor, patch) = self.config.node_version;
        let status = StatusPacket::Initial(InitialStatusPacket {
            network_id: self.config.network_id,
            chain_id: self.config.chain_id,
            genesis_hash: self.genesis_hash,
            tarcap_version: TARCAP_VERSION,
            pbft_chain_size: self.chain.size(),
            pbft_round: self.pbft.round(),
            dag_level: self.dag.max_level(),
            is_light_node: self.config.is_light_node,
            history_size: self.config.light_node_history,
            node_major_version: major,
            node_minor_version: minor,
            node_patch_version: patch,
        });
        self.send(to, PacketType::Status, &status);
    }

    fn handle_status(&self, packet: &PacketData) -> Result<(), PacketError> {
        match StatusPacket::decode(&mut packet.payload.as_slice())? {
            StatusPacket::Initial(status) => {
                if self.peers.get(&packet.from).is_some() {
                    return Err(PacketError::MaliciousPeer(
                        "second initial status".into(),
                    ));
                }
                if status.network_id != self.config.network_id {
                    debug!(peer = %packet.from, "wrong network id");
                    self.disconnect(&packet.from, DisconnectReason::IncompatiblePeer);
                    return Ok(());
                }
                if status.chain_id != self.config.chain_id
                    || status.genesis_hash != self.genesis_hash
                {
                    debug!(peer = %packet.from, "wrong chain or genesis");
                    self.disconnect(&packet.from, DisconnectReason::IncompatiblePeer);
                    return Ok(());
                }
                if status.tarcap_version != TARCAP_VERSION {
                    // No shared capability: a clean refusal, not an offence.
                    debug!(
                        peer = %packet.from,
                        version = status.tarcap_version,
                        "unsupported protocol version"
                    );
                    self.disconnect(&packet.from, DisconnectReason::IncompatiblePeer);
                    return Ok(());
                }
                // The session registration may still be in flight on our
                // side; the transport already authenticated the node id.
                self.peers.register_pending(packet.from);
                let Some(peer) = self.peers.promote(&packet.from) else {
                    return Err(PacketError::Transient("status without session".into()));
                };
                store_status(
                    &peer,
                    status.pbft_chain_size,
                    status.pbft_round,
                    status.dag_level,
                );
                peer.is_light_node
                    .store(status.is_light_node, std::sync::atomic::Ordering::Relaxed);
                peer.history_size
                    .store(status.history_size, std::sync::atomic::Ordering::Relaxed);
                info!(peer = %packet.from, chain_size = status.pbft_chain_size, "peer handshaken");
                self.start_pbft_sync_if_behind();
                Ok(())
            }
            StatusPacket::Update(status) => {
                let Some(peer) = self.peers.get(&packet.from) else {
                    return Err(PacketError::Transient("status before handshake".into()));
                };
                store_status(
                    &peer,
                    status.pbft_chain_size,
                    status.pbft_round,
                    status.dag_level,
                );
                self.start_pbft_sync_if_behind();
                Ok(())
            }
        }
    }

    // =========================================================================
    // DAG blocks & transactions
    // =========================================================================

    fn handle_dag_block(&self, packet: &PacketData) -> Result<(), PacketError> {
        let DagBlockPacket {
            block,
            transactions,
        } = DagBlockPacket::decode(&mut packet.payload.as_slice())?;
        let hash = block.hash();

        if let Some(peer) = self.peers.get(&packet.from) {
            peer.mark_dag_block_known(&hash);
            for trx in &transactions {
                peer.mark_transaction_known(&trx.hash());
            }
        }
        if self.dag.is_block_known(&hash) {
            return Ok(());
        }
        if !block.verify_sig() {
            return Err(PacketError::MaliciousPeer("dag block bad signature".into()));
        }

        let candidates: HashMap<_, _> = transactions
            .into_iter()
            .map(|trx| (trx.hash(), trx))
            .collect();
        let (status, verified_trxs) = self.dag.verify_block(&block, &candidates);
        match status {
            VerifyBlockStatus::Verified => {}
            VerifyBlockStatus::ExpiredBlock => return Err(PacketError::StaleInput),
            VerifyBlockStatus::AheadBlock | VerifyBlockStatus::FutureBlock => {
                // We are behind; try to catch up.
                self.start_pbft_sync_if_behind();
                return Err(PacketError::Transient("block ahead of state".into()));
            }
            VerifyBlockStatus::MissingTransaction => {
                return Err(PacketError::Transient("missing transactions".into()))
            }
            VerifyBlockStatus::MissingTip => {
                self.request_dag_sync(&packet.from);
                return Err(PacketError::Transient("missing tip".into()));
            }
            VerifyBlockStatus::FailedTipsVerification
            | VerifyBlockStatus::FailedVdfVerification
            | VerifyBlockStatus::NotEligible
            | VerifyBlockStatus::IncorrectTransactionsEstimation
            | VerifyBlockStatus::BlockTooBig => {
                return Err(PacketError::MaliciousPeer(format!(
                    "invalid dag block: {status:?}"
                )));
            }
        }

        match self.dag.add_dag_block(block, verified_trxs, false, true) {
            Ok(()) => Ok(()),
            Err(DagError::MissingTipsOrPivot(_)) => {
                self.request_dag_sync(&packet.from);
                Err(PacketError::Transient("missing pivot or tips".into()))
            }
            Err(DagError::Expired { .. }) => Err(PacketError::StaleInput),
            Err(DagError::LevelMismatch { .. }) => {
                Err(PacketError::MaliciousPeer("dag block level mismatch".into()))
            }
            Err(DagError::Storage(err)) => Err(PacketError::Transient(err)),
        }
    }

    fn handle_transactions(&self, packet: &PacketData) -> Result<(), PacketError> {
        let TransactionsPacket { transactions } =
            TransactionsPacket::decode(&mut packet.payload.as_slice())?;
        let peer = self.peers.get(&packet.from);

        for trx in transactions {
            let hash = trx.hash();
            if let Some(peer) = &peer {
                peer.mark_transaction_known(&hash);
            }
            match self.pool.insert_transaction(trx) {
                Ok(())
                | Err(InsertError::Duplicate)
                | Err(InsertError::Stale { .. })
                | Err(InsertError::GasPriceTooLow)
                | Err(InsertError::InsufficientBalance) => {}
                Err(InsertError::InvalidChainId { .. }) | Err(InsertError::InvalidSignature) => {
                    return Err(PacketError::MaliciousPeer(
                        "unverifiable transaction".into(),
                    ));
                }
                Err(InsertError::OverflowGasLimit) => {
                    return Err(PacketError::MaliciousPeer(
                        "transaction over gas cap".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Votes
    // =========================================================================

    fn handle_vote(&self, packet: &PacketData) -> Result<(), PacketError> {
        let VotePacket { vote, block, .. } = VotePacket::decode(&mut packet.payload.as_slice())?;
        if let Some(peer) = self.peers.get(&packet.from) {
            peer.mark_vote_known(&vote.hash());
            if let Some(block) = &block {
                peer.mark_pbft_block_known(&block.hash());
            }
        }
        if let Some(block) = block {
            if vote.vote_type() != VoteType::Propose || block.hash() != vote.block_hash() {
                return Err(PacketError::MaliciousPeer(
                    "vote bundled with unrelated block".into(),
                ));
            }
            if !block.verify_sig() {
                return Err(PacketError::MaliciousPeer("pbft block bad signature".into()));
            }
            self.pbft.proposed_blocks().push_proposed_block(block);
        }
        self.ingest_vote(vote)
    }

    fn ingest_vote(&self, vote: Vote) -> Result<(), PacketError> {
        if !self
            .vote_mgr
            .is_pbft_relevant_vote(&vote, self.pbft.period(), self.pbft.round())
        {
            return Err(PacketError::StaleInput);
        }
        if self.vote_mgr.vote_in_verified_map(&vote) {
            return Ok(());
        }
        match self.vote_mgr.verify_vote(&vote) {
            Ok(()) => {}
            Err(VoteError::FutureBlock) => {
                self.start_pbft_sync_if_behind();
                return Err(PacketError::Transient("vote ahead of state".into()));
            }
            Err(err) => {
                return Err(PacketError::MaliciousPeer(format!("invalid vote: {err}")));
            }
        }
        match self.pbft.add_external_vote(&vote) {
            Ok(true) => {
                self.gossip_vote_internal(&vote, None);
                Ok(())
            }
            Ok(false) => Ok(()),
            // The relayed pair proves the offence; the relay is not the
            // offender.
            Err(VoteError::DoubleVote { .. }) => Ok(()),
            Err(err) => Err(PacketError::Transient(err.to_string())),
        }
    }

    fn handle_votes_bundle(&self, packet: &PacketData) -> Result<(), PacketError> {
        let bundle = VotesBundlePacket::decode(&mut packet.payload.as_slice())?;
        if bundle.votes.is_empty() || bundle.votes.len() > 2_000 {
            return Err(PacketError::MaliciousPeer("degenerate votes bundle".into()));
        }
        let peer = self.peers.get(&packet.from);
        for vote in bundle.votes {
            if vote.period() != bundle.period || vote.round() != bundle.round {
                return Err(PacketError::MaliciousPeer(
                    "bundle vote at wrong coordinates".into(),
                ));
            }
            if let Some(peer) = &peer {
                peer.mark_vote_known(&vote.hash());
            }
            match self.ingest_vote(vote) {
                Ok(()) | Err(PacketError::StaleInput) | Err(PacketError::Transient(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn handle_get_next_votes_sync(&self, packet: &PacketData) -> Result<(), PacketError> {
        let request = GetNextVotesSyncPacket::decode(&mut packet.payload.as_slice())?;
        // Serve the bundle that advanced us past the requested round.
        let Some((value, _)) = self.vote_mgr.get_two_t_plus_one_voted_block(
            request.period,
            request.round,
            VoteType::Next,
        ) else {
            return Ok(());
        };
        let votes =
            self.vote_mgr
                .get_two_t_plus_one_votes(request.period, request.round, VoteType::Next, &value);
        if votes.is_empty() {
            return Ok(());
        }
        let bundle = VotesBundlePacket {
            period: request.period,
            round: request.round,
            step: votes[0].step(),
            block_hash: value,
            votes,
        };
        self.send(&packet.from, PacketType::VotesBundle, &bundle);
        Ok(())
    }

    // =========================================================================
    // DAG sync
    // =========================================================================

    fn handle_get_dag_sync(&self, packet: &PacketData) -> Result<(), PacketError> {
        let request = GetDagSyncPacket::decode(&mut packet.payload.as_slice())?;
        let Some(peer) = self.peers.get(&packet.from) else {
            return Err(PacketError::StaleInput);
        };
        if self.threadpool.queue_size() > MAX_QUEUE_SIZE_TO_DROP_SYNCING {
            debug!(peer = %packet.from, "queue over limit, refusing dag sync");
            self.disconnect(&packet.from, DisconnectReason::TooManyPeers);
            return Ok(());
        }
        if !peer.request_dag_sync_allowance() {
            return Err(PacketError::MaliciousPeer(
                "dag sync requested within allowance window".into(),
            ));
        }

        let known: HashSet<_> = request.known_blocks.iter().copied().collect();
        let (period, blocks, transactions) =
            self.dag.get_non_finalized_blocks_with_transactions(&known);

        // Split replies that would blow the packet budget.
        let mut chunk_blocks = Vec::new();
        let mut chunk_size = 0usize;
        let mut chunks: Vec<Vec<DagBlock>> = Vec::new();
        for block in blocks {
            let len = alloy_rlp::encode(&block).len();
            if chunk_size + len > MAX_PACKET_SIZE / 2 && !chunk_blocks.is_empty() {
                chunks.push(std::mem::take(&mut chunk_blocks));
                chunk_size = 0;
            }
            chunk_size += len;
            chunk_blocks.push(block);
        }
        chunks.push(chunk_blocks);

        for (index, blocks) in chunks.iter().enumerate() {
            let block_trxs: HashSet<_> = blocks
                .iter()
                .flat_map(|b| b.trxs().iter().copied())
                .collect();
            let reply = DagSyncPacket {
                period,
                blocks: blocks.clone(),
                transactions: transactions
                    .iter()
                    .filter(|t| block_trxs.contains(&t.hash()))
                    .cloned()
                    .collect(),
            };
            trace!(peer = %packet.from, chunk = index, blocks = blocks.len(), "serving dag sync");
            self.send(&packet.from, PacketType::DagSync, &reply);
        }
        Ok(())
    }

    fn handle_dag_sync(&self, packet: &PacketData) -> Result<(), PacketError> {
        let reply = DagSyncPacket::decode(&mut packet.payload.as_slice())?;
        let Some(peer) = self.peers.get(&packet.from) else {
            return Err(PacketError::StaleInput);
        };
        if peer.dag_synced.swap(true, std::sync::atomic::Ordering::SeqCst) {
            // Unsolicited second reply.
            return Err(PacketError::MaliciousPeer("unexpected dag sync".into()));
        }

        let candidates: HashMap<_, _> = reply
            .transactions
            .into_iter()
            .map(|trx| (trx.hash(), trx))
            .collect();
        for block in reply.blocks {
            let hash = block.hash();
            peer.mark_dag_block_known(&hash);
            if self.dag.is_block_known(&hash) {
                continue;
            }
            let (status, trxs) = self.dag.verify_block(&block, &candidates);
            match status {
                VerifyBlockStatus::Verified => {
                    if let Err(err) = self.dag.add_dag_block(block, trxs, false, true) {
                        debug!(%hash, %err, "synced dag block not insertable");
                    }
                }
                VerifyBlockStatus::ExpiredBlock | VerifyBlockStatus::AheadBlock => {}
                other => {
                    return Err(PacketError::MaliciousPeer(format!(
                        "invalid block in dag sync: {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Client side: ask `peer` for the non-finalized blocks we lack.
    pub fn request_dag_sync(&self, peer_id: &NodeId) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        peer.dag_synced.store(false, std::sync::atomic::Ordering::SeqCst);
        let (period, levels) = self.dag.get_non_finalized_blocks();
        let known_blocks: Vec<_> = levels.into_values().flatten().collect();
        let request = GetDagSyncPacket {
            period,
            known_blocks,
        };
        self.send(peer_id, PacketType::GetDagSync, &request);
    }

    // =========================================================================
    // PBFT sync
    // =========================================================================

    fn handle_get_pbft_sync(&self, packet: &PacketData) -> Result<(), PacketError> {
        let request = GetPbftSyncPacket::decode(&mut packet.payload.as_slice())?;
        if self.threadpool.queue_size() > MAX_QUEUE_SIZE_TO_DROP_SYNCING {
            self.disconnect(&packet.from, DisconnectReason::TooManyPeers);
            return Ok(());
        }
        let chain_size = self.chain.size();
        if request.from_period > chain_size {
            return Err(PacketError::StaleInput);
        }

        let window_end = (request.from_period + self.config.sync_level_size).min(chain_size + 1);
        for period in request.from_period..window_end {
            let Some(period_data) = self.chain.get_period_data(period) else {
                // Pruned history (light node): nothing more to serve.
                break;
            };
            let cert_votes = self
                .db
                .cert_votes(&period_data.pbft_block.hash())
                .unwrap_or_default();
            let reply = PbftSyncPacket {
                period_data,
                cert_votes,
                last: period + 1 == window_end,
            };
            self.send(&packet.from, PacketType::PbftSync, &reply);
        }
        Ok(())
    }

    fn handle_pbft_sync(&self, packet: &PacketData) -> Result<(), PacketError> {
        let reply = PbftSyncPacket::decode(&mut packet.payload.as_slice())?;
        {
            let syncing = self.syncing_peer.lock();
            if *syncing != Some(packet.from) {
                return Err(PacketError::StaleInput);
            }
        }
        let period = reply.period_data.pbft_block.period();
        let queued = self.pbft.period_data_queue().push(
            reply.period_data,
            reply.cert_votes,
            packet.from,
            self.chain.size(),
        );
        if !queued {
            trace!(period, "out-of-order sync period dropped");
        }

        if reply.last {
            let mut syncing = self.syncing_peer.lock();
            *syncing = None;
            drop(syncing);
            if let Some(peer) = self.peers.get(&packet.from) {
                peer.syncing_from
                    .store(false, std::sync::atomic::Ordering::SeqCst);
            }
            // The queue drains asynchronously; once it has, a follow-up
            // status exchange decides whether another window is needed.
        }
        Ok(())
    }

    /// Pick the best sync target and request a window when we are behind.
    pub fn start_pbft_sync_if_behind(&self) {
        let our_size = self.chain.size();
        {
            let syncing = self.syncing_peer.lock();
            if syncing.is_some() {
                return;
            }
        }
        let Some(peer) = self.select_sync_peer(our_size) else {
            return;
        };
        let target = peer
            .pbft_chain_size
            .load(std::sync::atomic::Ordering::Relaxed);
        if target <= our_size {
            return;
        }

        info!(peer = %peer.node_id, target, our_size, "pbft syncing");
        *self.syncing_peer.lock() = Some(peer.node_id);
        peer.syncing_from
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let request = GetPbftSyncPacket {
            from_period: our_size + 1,
        };
        self.send(&peer.node_id, PacketType::GetPbftSync, &request);
    }

    /// Largest `pbft_chain_size`, ties by `dag_level`; light peers are
    /// disqualified when their retained history cannot reach us.
    fn select_sync_peer(&self, our_size: u64) -> Option<Arc<Peer>> {
        self.peers
            .all()
            .into_iter()
            .filter(|peer| {
                let light = peer.is_light_node.load(std::sync::atomic::Ordering::Relaxed);
                if !light {
                    return true;
                }
                let size = peer
                    .pbft_chain_size
                    .load(std::sync::atomic::Ordering::Relaxed);
                let history = peer.history_size.load(std::sync::atomic::Ordering::Relaxed);
                size.saturating_sub(history) <= our_size
            })
            .max_by_key(|peer| {
                (
                    peer.pbft_chain_size
                        .load(std::sync::atomic::Ordering::Relaxed),
                    peer.dag_level.load(std::sync::atomic::Ordering::Relaxed),
                )
            })
    }

    // =========================================================================
    // Pillar votes
    // =========================================================================

    fn handle_pillar_vote(&self, packet: &PacketData) -> Result<(), PacketError> {
        let PillarVotePacket { vote } = PillarVotePacket::decode(&mut packet.payload.as_slice())?;
        if let Some(peer) = self.peers.get(&packet.from) {
            peer.mark_pillar_vote_known(&vote.hash());
        }
        self.ingest_pillar_vote(vote, true)
    }

    fn ingest_pillar_vote(&self, vote: PillarVote, gossip: bool) -> Result<(), PacketError> {
        if !self.pillar.is_relevant_pillar_vote(&vote) {
            return Err(PacketError::StaleInput);
        }
        self.pillar
            .validate_pillar_vote(&vote)
            .map_err(|err| PacketError::MaliciousPeer(err.to_string()))?;
        match self.pillar.add_verified_pillar_vote(&vote) {
            Ok(true) => {
                if gossip {
                    self.gossip_pillar_vote_internal(&vote);
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(_) => Err(PacketError::StaleInput),
        }
    }

    fn handle_get_pillar_votes_bundle(&self, packet: &PacketData) -> Result<(), PacketError> {
        let request = GetPillarVotesBundlePacket::decode(&mut packet.payload.as_slice())?;
        let mut votes = self.pillar.get_verified_pillar_votes(&request.pillar_block_hash);
        votes.retain(|vote| vote.period() == request.period);
        votes.truncate(MAX_PILLAR_VOTES_IN_BUNDLE);
        if votes.is_empty() {
            return Ok(());
        }
        self.send(
            &packet.from,
            PacketType::PillarVotesBundle,
            &PillarVotesBundlePacket { votes },
        );
        Ok(())
    }

    fn handle_pillar_votes_bundle(&self, packet: &PacketData) -> Result<(), PacketError> {
        let bundle = PillarVotesBundlePacket::decode(&mut packet.payload.as_slice())?;
        if bundle.votes.len() > MAX_PILLAR_VOTES_IN_BUNDLE {
            return Err(PacketError::MaliciousPeer("oversized pillar bundle".into()));
        }
        for vote in bundle.votes {
            match self.ingest_pillar_vote(vote, false) {
                Ok(()) | Err(PacketError::StaleInput) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Periodic check: request votes for a pillar block still short of
    /// 2t+1.
    pub fn check_pillar_votes(&self) {
        let Some((period, pillar_block_hash)) = self.pillar.needs_votes() else {
            return;
        };
        let request = GetPillarVotesBundlePacket {
            period,
            pillar_block_hash,
        };
        // Any one peer suffices; pick the best-synced.
        if let Some(peer) = self.select_sync_peer(0) {
            self.send(&peer.node_id, PacketType::GetPillarVotesBundle, &request);
        }
    }

    // =========================================================================
    // Periodic maintenance
    // =========================================================================

    /// Driven by the runtime on a fixed interval: status refresh, overdue
    /// handshakes, pillar vote top-up, sync restart, stats.
    pub fn periodic(&self) {
        for node_id in self.peers.overdue_pending() {
            debug!(peer = %node_id, "initial status overdue");
            self.disconnect(&node_id, DisconnectReason::BadProtocol);
            self.peers.remove(&node_id);
        }
        let update = StatusPacket::Update(StatusUpdatePacket {
            pbft_chain_size: self.chain.size(),
            pbft_round: self.pbft.round(),
            dag_level: self.dag.max_level(),
        });
        for peer in self.peers.all() {
            self.send(&peer.node_id, PacketType::Status, &update);
        }
        self.check_pillar_votes();
        self.start_pbft_sync_if_behind();
        self.stats.log_and_reset();
    }

    // =========================================================================
    // Gossip
    // =========================================================================

    pub fn gossip_transactions(&self, transactions: &[Transaction]) {
        for peer in self.peers.all() {
            if peer.syncing_from.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            let fresh: Vec<Transaction> = transactions
                .iter()
                .filter(|trx| peer.mark_transaction_known(&trx.hash()))
                .cloned()
                .collect();
            if fresh.is_empty() {
                continue;
            }
            self.send(
                &peer.node_id,
                PacketType::Transactions,
                &TransactionsPacket {
                    transactions: fresh,
                },
            );
        }
    }

    fn gossip_vote_internal(&self, vote: &Vote, block: Option<&PbftBlock>) {
        let packet = match block {
            Some(block) => {
                VotePacket::with_block(vote.clone(), block.clone(), self.chain.size())
            }
            None => VotePacket::vote_only(vote.clone()),
        };
        for peer in self.peers.all() {
            if peer.syncing_from.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            if !peer.mark_vote_known(&vote.hash()) {
                continue;
            }
            if let Some(block) = block {
                peer.mark_pbft_block_known(&block.hash());
            }
            self.send(&peer.node_id, PacketType::Vote, &packet);
        }
    }

    fn gossip_pillar_vote_internal(&self, vote: &PillarVote) {
        let packet = PillarVotePacket { vote: vote.clone() };
        for peer in self.peers.all() {
            if peer.syncing_from.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            if !peer.mark_pillar_vote_known(&vote.hash()) {
                continue;
            }
            self.send(&peer.node_id, PacketType::PillarVote, &packet);
        }
    }

    // =========================================================================
    // Transport plumbing
    // =========================================================================

    fn send<T: alloy_rlp::Encodable>(&self, to: &NodeId, packet_type: PacketType, message: &T) {
        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            return;
        };
        let payload = alloy_rlp::encode(message);
        if payload.len() > MAX_PACKET_SIZE {
            warn!(?packet_type, size = payload.len(), "refusing to send oversized packet");
            return;
        }
        if sender.send_packet(to, packet_type, payload) {
            if let Some(peer) = self.peers.get_any(to) {
                peer.sent_packets
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    fn punish(&self, node_id: &NodeId, reason: DisconnectReason, malicious: bool) {
        if malicious {
            self.peers.set_malicious(node_id);
        } else {
            self.peers.remove(node_id);
        }
        self.disconnect(node_id, reason);
    }

    fn disconnect(&self, node_id: &NodeId, reason: DisconnectReason) {
        self.peers.remove(node_id);
        let sender = self.sender.read().clone();
        if let Some(sender) = sender {
            sender.disconnect(node_id, reason);
        }
    }
}

fn store_status(peer: &Peer, chain_size: u64, round: u64, dag_level: u64) {
    peer.pbft_chain_size
        .store(chain_size, std::sync::atomic::Ordering::Relaxed);
    peer.pbft_round
        .store(round, std::sync::atomic::Ordering::Relaxed);
    peer.dag_level
        .store(dag_level, std::sync::atomic::Ordering::Relaxed);
}

/// Newtype wiring the network into the threadpool.
struct Dispatcher(Arc<Network>);

impl PacketProcessor for Dispatcher {
    fn process(&self, packet: PacketData) {
        self.0.process_packet(packet);
    }
}

// =============================================================================
// Gossip ports for the managers (injected via set_network)
// =============================================================================

impl DagBlockGossiper for Network {
    fn gossip_dag_block(&self, block: &DagBlock, trxs: &[Transaction], _proposed: bool) {
        let hash = block.hash();
        for peer in self.peers.all() {
            if peer.syncing_from.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            if !peer.mark_dag_block_known(&hash) {
                continue;
            }
            // Only ship payloads the peer has not seen.
            let transactions: Vec<Transaction> = trxs
                .iter()
                .filter(|trx| peer.mark_transaction_known(&trx.hash()))
                .cloned()
                .collect();
            self.send(
                &peer.node_id,
                PacketType::DagBlock,
                &DagBlockPacket {
                    block: block.clone(),
                    transactions,
                },
            );
        }
    }
}

impl ConsensusGossiper for Network {
    fn gossip_vote(&self, vote: &Vote, block: Option<&PbftBlock>) {
        self.gossip_vote_internal(vote, block);
    }

    fn gossip_votes_bundle(&self, votes: &[Vote]) {
        let Some(first) = votes.first() else {
            return;
        };
        let bundle = VotesBundlePacket {
            period: first.period(),
            round: first.round(),
            step: first.step(),
            block_hash: first.block_hash(),
            votes: votes.to_vec(),
        };
        for peer in self.peers.all() {
            if peer.syncing_from.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            for vote in votes {
                peer.mark_vote_known(&vote.hash());
            }
            self.send(&peer.node_id, PacketType::VotesBundle, &bundle);
        }
    }
}

impl PillarVoteGossiper for Network {
    fn gossip_pillar_vote(&self, vote: &PillarVote) {
        self.gossip_pillar_vote_internal(vote);
    }
}
