//! Per-peer protocol state.
//!
//! Each connected peer tracks the remote chain view from status packets,
//! bounded known-hash caches that gossip consults, sync allowance timers
//! and a suspicious-packet rate counter.

use parking_lot::{Mutex, RwLock};
use shared_types::{NodeId, B256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Capacity of each known-hashes cache.
const MAX_KNOWN_CACHE: usize = 10_000;

/// Suspicious packets tolerated per rolling minute before disconnect.
pub const MAX_SUSPICIOUS_PACKETS_PER_MINUTE: u32 = 50;

/// Minimum spacing between serving two DAG syncs to the same peer.
pub const DAG_SYNC_ALLOWANCE: Duration = Duration::from_secs(60);

/// How long a malicious peer stays banned.
pub const MALICIOUS_COOLDOWN: Duration = Duration::from_secs(300);

/// Deadline for the initial status packet after connect.
pub const INITIAL_STATUS_DEADLINE: Duration = Duration::from_secs(60);

/// Insertion-ordered set with a hard capacity; old entries fall out.
#[derive(Debug, Default)]
struct BoundedHashSet {
    set: HashSet<B256>,
    order: VecDeque<B256>,
}

impl BoundedHashSet {
    fn insert(&mut self, hash: B256) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > MAX_KNOWN_CACHE {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, hash: &B256) -> bool {
        self.set.contains(hash)
    }
}

/// State of one connected peer.
pub struct Peer {
    pub node_id: NodeId,
    pub connected_at: Instant,

    // Remote chain view, refreshed by status packets.
    pub pbft_chain_size: AtomicU64,
    pub pbft_round: AtomicU64,
    pub dag_level: AtomicU64,
    pub is_light_node: AtomicBool,
    pub history_size: AtomicU64,

    // Handshake progress.
    initial_status_received: AtomicBool,

    // We are currently pulling chain history from this peer.
    pub syncing_from: AtomicBool,
    /// One successful DAG sync per connection unless re-armed.
    pub dag_synced: AtomicBool,
    last_dag_sync_served: Mutex<Option<Instant>>,

    known_dag_blocks: RwLock<BoundedHashSet>,
    known_transactions: RwLock<BoundedHashSet>,
    known_votes: RwLock<BoundedHashSet>,
    known_pbft_blocks: RwLock<BoundedHashSet>,
    known_pillar_votes: RwLock<BoundedHashSet>,

    suspicious: Mutex<(u32, Instant)>,
    pub sent_packets: AtomicU64,
    pub received_packets: AtomicU64,
}

impl Peer {
    pub fn new(node_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            connected_at: Instant::now(),
            pbft_chain_size: AtomicU64::new(0),
            pbft_round: AtomicU64::new(1),
            dag_level: AtomicU64::new(0),
            is_light_node: AtomicBool::new(false),
            history_size: AtomicU64::new(0),
            initial_status_received: AtomicBool::new(false),
            syncing_from: AtomicBool::new(false),
            dag_synced: AtomicBool::new(false),
            last_dag_sync_served: Mutex::new(None),
            known_dag_blocks: RwLock::new(BoundedHashSet::default()),
            known_transactions: RwLock::new(BoundedHashSet::default()),
            known_votes: RwLock::new(BoundedHashSet::default()),
            known_pbft_blocks: RwLock::new(BoundedHashSet::default()),
            known_pillar_votes: RwLock::new(BoundedHashSet::default()),
            suspicious: Mutex::new((0, Instant::now())),
            sent_packets: AtomicU64::new(0),
            received_packets: AtomicU64::new(0),
        })
    }

    pub fn mark_initial_status_received(&self) {
        self.initial_status_received.store(true, Ordering::Release);
    }

    pub fn initial_status_received(&self) -> bool {
        self.initial_status_received.load(Ordering::Acquire)
    }

    pub fn initial_status_overdue(&self) -> bool {
        !self.initial_status_received() && self.connected_at.elapsed() > INITIAL_STATUS_DEADLINE
    }

    // Known-hash caches; `mark_*` returns false when already known.

    pub fn mark_dag_block_known(&self, hash: &B256) -> bool {
        self.known_dag_blocks.write().insert(*hash)
    }

    pub fn is_dag_block_known(&self, hash: &B256) -> bool {
        self.known_dag_blocks.read().contains(hash)
    }

    pub fn mark_transaction_known(&self, hash: &B256) -> bool {
        self.known_transactions.write().insert(*hash)
    }

    pub fn is_transaction_known(&self, hash: &B256) -> bool {
        self.known_transactions.read().contains(hash)
    }

    pub fn mark_vote_known(&self, hash: &B256) -> bool {
        self.known_votes.write().insert(*hash)
    }

    pub fn is_vote_known(&self, hash: &B256) -> bool {
        self.known_votes.read().contains(hash)
    }

    pub fn mark_pbft_block_known(&self, hash: &B256) -> bool {
        self.known_pbft_blocks.write().insert(*hash)
    }

    pub fn is_pbft_block_known(&self, hash: &B256) -> bool {
        self.known_pbft_blocks.read().contains(hash)
    }

    pub fn mark_pillar_vote_known(&self, hash: &B256) -> bool {
        self.known_pillar_votes.write().insert(*hash)
    }

    pub fn is_pillar_vote_known(&self, hash: &B256) -> bool {
        self.known_pillar_votes.read().contains(hash)
    }

    /// Count one suspicious packet; true when the rate limit is blown.
    pub fn report_suspicious_packet(&self) -> bool {
        let mut counter = self.suspicious.lock();
        if counter.1.elapsed() > Duration::from_secs(60) {
            *counter = (0, Instant::now());
        }
        counter.0 += 1;
        if counter.0 > MAX_SUSPICIOUS_PACKETS_PER_MINUTE {
            warn!(peer = %self.node_id, "suspicious packet rate exceeded");
            return true;
        }
        false
    }

    /// Whether this peer may be served another DAG sync now; arms the
    /// allowance timer when permitted.
    pub fn request_dag_sync_allowance(&self) -> bool {
        let mut last = self.last_dag_sync_served.lock();
        match *last {
            Some(at) if at.elapsed() < DAG_SYNC_ALLOWANCE => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// Why a peer is being dropped; mirrored onto the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Unparseable or structurally wrong packets.
    BadProtocol,
    /// Demonstrated protocol violation; also marks malicious.
    UserReason,
    /// Handshake failure (wrong network, chain or genesis).
    IncompatiblePeer,
    /// Local resource pressure.
    TooManyPeers,
}

/// The connected-peer table plus the malicious set.
#[derive(Default)]
pub struct PeersState {
    /// Fully handshaken peers.
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
    /// Connected, awaiting their initial status packet.
    pending: RwLock<HashMap<NodeId, Arc<Peer>>>,
    malicious: Mutex<HashMap<NodeId, Instant>>,
}

impl PeersState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a fresh connection until its initial status arrives.
    /// Idempotent: an already-tracked peer is returned as-is.
    pub fn register_pending(&self, node_id: NodeId) -> Arc<Peer> {
        if let Some(existing) = self.get_any(&node_id) {
            return existing;
        }
        let peer = Peer::new(node_id);
        self.pending.write().insert(node_id, peer.clone());
        peer
    }

    /// Promote a pending peer after a valid initial status.
    pub fn promote(&self, node_id: &NodeId) -> Option<Arc<Peer>> {
        let peer = self.pending.write().remove(node_id)?;
        peer.mark_initial_status_received();
        self.peers.write().insert(*node_id, peer.clone());
        debug!(peer = %node_id, "peer promoted");
        Some(peer)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn get_any(&self, node_id: &NodeId) -> Option<Arc<Peer>> {
        self.get(node_id)
            .or_else(|| self.pending.read().get(node_id).cloned())
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.peers.write().remove(node_id);
        self.pending.write().remove(node_id);
    }

    pub fn set_malicious(&self, node_id: &NodeId) {
        self.malicious.lock().insert(*node_id, Instant::now());
        self.remove(node_id);
    }

    pub fn is_malicious(&self, node_id: &NodeId) -> bool {
        let mut malicious = self.malicious.lock();
        match malicious.get(node_id) {
            Some(at) if at.elapsed() < MALICIOUS_COOLDOWN => true,
            Some(_) => {
                malicious.remove(node_id);
                false
            }
            None => false,
        }
    }

    /// Pending peers whose handshake deadline expired.
    pub fn overdue_pending(&self) -> Vec<NodeId> {
        self.pending
            .read()
            .values()
            .filter(|peer| peer.initial_status_overdue())
            .map(|peer| peer.node_id)
            .collect()
    }
}
