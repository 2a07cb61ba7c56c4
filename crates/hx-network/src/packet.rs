//! Packet taxonomy.
//!
//! Every wire packet has a type byte, a scheduling priority and (for a
//! small set) a "one at a time" blocking requirement enforced by the
//! threadpool's dependency mask.

use shared_types::NodeId;
use std::time::Instant;

/// The protocol version this capability speaks. Peers advertising any
/// other version share no capability and are not connected.
pub const TARCAP_VERSION: u16 = 1;

/// Hard cap on a single packet's payload.
pub const MAX_PACKET_SIZE: usize = 15 * 1024 * 1024;

/// Scheduling priority bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketPriority {
    High = 0,
    Mid = 1,
    Low = 2,
}

pub const PRIORITY_COUNT: usize = 3;

/// All packet types of the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Status = 0x01,
    DagBlock = 0x02,
    Transactions = 0x03,
    Vote = 0x04,
    VotesBundle = 0x05,
    GetNextVotesSync = 0x06,
    GetDagSync = 0x07,
    DagSync = 0x08,
    GetPbftSync = 0x09,
    PbftSync = 0x0A,
    PillarVote = 0x0B,
    GetPillarVotesBundle = 0x0C,
    PillarVotesBundle = 0x0D,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Status),
            0x02 => Some(Self::DagBlock),
            0x03 => Some(Self::Transactions),
            0x04 => Some(Self::Vote),
            0x05 => Some(Self::VotesBundle),
            0x06 => Some(Self::GetNextVotesSync),
            0x07 => Some(Self::GetDagSync),
            0x08 => Some(Self::DagSync),
            0x09 => Some(Self::GetPbftSync),
            0x0A => Some(Self::PbftSync),
            0x0B => Some(Self::PillarVote),
            0x0C => Some(Self::GetPillarVotesBundle),
            0x0D => Some(Self::PillarVotesBundle),
            _ => None,
        }
    }

    /// Consensus votes outrank block/transaction flow, which outranks
    /// status and syncing.
    pub fn priority(&self) -> PacketPriority {
        match self {
            Self::Vote | Self::VotesBundle | Self::GetNextVotesSync => PacketPriority::High,
            Self::DagBlock | Self::Transactions => PacketPriority::Mid,
            Self::Status
            | Self::GetDagSync
            | Self::DagSync
            | Self::GetPbftSync
            | Self::PbftSync
            | Self::PillarVote
            | Self::GetPillarVotesBundle
            | Self::PillarVotesBundle => PacketPriority::Low,
        }
    }

    /// Types processed strictly one at a time across all peers.
    pub fn is_hard_blocked(&self) -> bool {
        matches!(
            self,
            Self::GetDagSync | Self::DagSync | Self::PbftSync | Self::PillarVotesBundle
        )
    }

    /// Bit in the blocked-packets mask.
    pub fn mask_bit(&self) -> u32 {
        1u32 << (*self as u8)
    }
}

/// One received packet waiting for (or in) processing.
#[derive(Debug, Clone)]
pub struct PacketData {
    pub from: NodeId,
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

impl PacketData {
    pub fn new(from: NodeId, packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            from,
            packet_type,
            payload,
            received_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte_roundtrip() {
        for byte in 0x01..=0x0Du8 {
            let packet_type = PacketType::from_u8(byte).unwrap();
            assert_eq!(packet_type as u8, byte);
        }
        assert!(PacketType::from_u8(0x00).is_none());
        assert!(PacketType::from_u8(0x0E).is_none());
    }

    #[test]
    fn test_priorities_match_protocol() {
        assert_eq!(PacketType::Vote.priority(), PacketPriority::High);
        assert_eq!(PacketType::VotesBundle.priority(), PacketPriority::High);
        assert_eq!(PacketType::GetNextVotesSync.priority(), PacketPriority::High);
        assert_eq!(PacketType::DagBlock.priority(), PacketPriority::Mid);
        assert_eq!(PacketType::Transactions.priority(), PacketPriority::Mid);
        assert_eq!(PacketType::Status.priority(), PacketPriority::Low);
        assert_eq!(PacketType::PbftSync.priority(), PacketPriority::Low);
    }

    #[test]
    fn test_hard_blocked_set() {
        let blocked: Vec<PacketType> = (0x01..=0x0Du8)
            .filter_map(PacketType::from_u8)
            .filter(PacketType::is_hard_blocked)
            .collect();
        assert_eq!(
            blocked,
            vec![
                PacketType::GetDagSync,
                PacketType::DagSync,
                PacketType::PbftSync,
                PacketType::PillarVotesBundle
            ]
        );
    }

    #[test]
    fn test_mask_bits_distinct() {
        let mut mask = 0u32;
        for byte in 0x01..=0x0Du8 {
            let bit = PacketType::from_u8(byte).unwrap().mask_bit();
            assert_eq!(mask & bit, 0);
            mask |= bit;
        }
    }
}
