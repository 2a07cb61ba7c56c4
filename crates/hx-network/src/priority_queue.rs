//! Priority-banded packet queues with dependency blocking.
//!
//! Three FIFO bands (High/Mid/Low). A packet is eligible to pop when its
//! band has a free worker slot, its type is not in the blocked mask, and
//! no packet of the same `(peer, type)` is currently processing — the
//! last rule preserves per-peer per-type receive order across parallel
//! workers.

use crate::packet::{PacketData, PacketPriority, PacketType, PRIORITY_COUNT};
use shared_types::NodeId;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// One band: FIFO plus a concurrent-worker quota.
#[derive(Debug)]
pub struct PacketsQueue {
    packets: VecDeque<PacketData>,
    max_workers: usize,
    active_workers: usize,
}

impl PacketsQueue {
    fn new(max_workers: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            max_workers,
            active_workers: 0,
        }
    }

    fn push_back(&mut self, packet: PacketData) {
        self.packets.push_back(packet);
    }

    fn is_processing_eligible(&self) -> bool {
        self.active_workers < self.max_workers && !self.packets.is_empty()
    }

    /// First packet not excluded by the blocked mask or the in-flight set.
    fn pop(
        &mut self,
        blocked_mask: u32,
        in_flight: &HashSet<(NodeId, PacketType)>,
    ) -> Option<PacketData> {
        let position = self.packets.iter().position(|packet| {
            blocked_mask & packet.packet_type.mask_bit() == 0
                && !in_flight.contains(&(packet.from, packet.packet_type))
        })?;
        self.packets.remove(position)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// The three bands plus shared dependency state.
#[derive(Debug)]
pub struct PriorityQueue {
    queues: [PacketsQueue; PRIORITY_COUNT],
    blocked_mask: u32,
    in_flight: HashSet<(NodeId, PacketType)>,
    max_total_workers: usize,
    active_total_workers: usize,
}

impl PriorityQueue {
    /// Worker split: 40% high, 50% mid, the rest low — at least one each.
    pub fn new(total_workers: usize) -> Self {
        let total = total_workers.max(1);
        let high = (total * 4 / 10).max(1);
        let mid = (total * 5 / 10).max(1);
        let low = total.saturating_sub(high + mid).max(1);
        Self {
            queues: [
                PacketsQueue::new(high),
                PacketsQueue::new(mid),
                PacketsQueue::new(low),
            ],
            blocked_mask: 0,
            in_flight: HashSet::new(),
            max_total_workers: total,
            active_total_workers: 0,
        }
    }

    pub fn push_back(&mut self, packet: PacketData) {
        let band = packet.packet_type.priority() as usize;
        self.queues[band].push_back(packet);
    }

    /// Highest-priority eligible packet, or `None` when every candidate is
    /// blocked or all workers are busy.
    pub fn pop(&mut self) -> Option<PacketData> {
        if self.active_total_workers >= self.max_total_workers {
            trace!("all workers busy");
            return None;
        }
        for queue in &mut self.queues {
            if queue.is_processing_eligible() {
                if let Some(packet) = queue.pop(self.blocked_mask, &self.in_flight) {
                    return Some(packet);
                }
            }
        }
        None
    }

    /// Mirror of [`Self::update_dependencies_finish`]; every dependency set
    /// here must be unset there.
    pub fn update_dependencies_start(&mut self, packet: &PacketData) {
        debug_assert!(self.active_total_workers < self.max_total_workers);
        self.active_total_workers += 1;
        self.queues[packet.packet_type.priority() as usize].active_workers += 1;

        if packet.packet_type.is_hard_blocked() {
            debug_assert!(self.blocked_mask & packet.packet_type.mask_bit() == 0);
            self.blocked_mask |= packet.packet_type.mask_bit();
        }
        self.in_flight.insert((packet.from, packet.packet_type));
    }

    pub fn update_dependencies_finish(&mut self, packet: &PacketData) {
        debug_assert!(self.active_total_workers > 0);
        self.active_total_workers -= 1;
        self.queues[packet.packet_type.priority() as usize].active_workers -= 1;

        if packet.packet_type.is_hard_blocked() {
            self.blocked_mask &= !packet.packet_type.mask_bit();
        }
        self.in_flight.remove(&(packet.from, packet.packet_type));
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(PacketsQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(PacketsQueue::is_empty)
    }
}
