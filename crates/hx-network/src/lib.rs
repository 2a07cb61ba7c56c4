//! # P2P Capability
//!
//! Wire protocol dispatch for the node:
//!
//! - `packet`: packet taxonomy (types, priorities, blocking)
//! - `messages`: typed RLP wire messages
//! - `peer`: per-peer state, known caches, the malicious set
//! - `priority_queue` / `threadpool`: dependency-aware parallel dispatch
//! - `service`: the capability itself — handshake, handlers, gossip, sync
//! - `stats`: per-period packet statistics
//!
//! The capability is transport-agnostic: byte frames arrive through
//! [`service::Network::receive_packet`] and leave through the injected
//! [`PacketSender`]. The TCP session layer lives in the node runtime.

pub mod messages;
pub mod packet;
pub mod peer;
pub mod priority_queue;
pub mod service;
pub mod stats;
pub mod threadpool;

pub use packet::{PacketPriority, PacketType, MAX_PACKET_SIZE, TARCAP_VERSION};
pub use peer::DisconnectReason;
pub use service::{Network, NetworkConfig};

use shared_types::NodeId;
use thiserror::Error;

/// Outcome of packet handling that requires policy, mapped onto the
/// transport by the dispatch layer.
#[derive(Debug, Clone, Error)]
pub enum PacketError {
    /// RLP parse failure or item-count mismatch → `BadProtocol` disconnect.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Demonstrable protocol violation → disconnect + malicious cooldown.
    #[error("malicious peer: {0}")]
    MaliciousPeer(String),

    /// Expired or obsolete input → silent drop, no penalty.
    #[error("stale input")]
    StaleInput,

    /// Not processable yet (missing deps, future period) → drop so a
    /// retry can succeed, no penalty.
    #[error("transient: {0}")]
    Transient(String),
}

impl From<alloy_rlp::Error> for PacketError {
    fn from(err: alloy_rlp::Error) -> Self {
        PacketError::Malformed(err.to_string())
    }
}

/// Outbound half of the transport, injected by the runtime.
pub trait PacketSender: Send + Sync {
    /// Returns false when the peer is gone or the session is saturated.
    fn send_packet(&self, to: &NodeId, packet_type: PacketType, payload: Vec<u8>) -> bool;

    fn disconnect(&self, peer: &NodeId, reason: DisconnectReason);
}
