//! Ordered hand-off between PBFT sync and the consensus driver.
//!
//! The sync handler pushes whole periods as they stream in; the driver
//! pops them in order, validates and finalizes. Entries carry the cert
//! votes proving the period (the last synced period ships its own votes,
//! earlier ones are proven by the next period's `previous_block_cert_votes`).

use parking_lot::Mutex;
use shared_types::{NodeId, PbftPeriod, PeriodData, Vote};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct QueuedPeriod {
    pub data: PeriodData,
    pub cert_votes: Vec<Vote>,
    /// Peer that served this period, blamed on validation failure.
    pub source: NodeId,
}

#[derive(Default)]
pub struct PeriodDataQueue {
    queue: Mutex<VecDeque<QueuedPeriod>>,
}

impl PeriodDataQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a period; refused unless it extends the queue (or the chain,
    /// when the queue is empty) by exactly one.
    pub fn push(
        &self,
        data: PeriodData,
        cert_votes: Vec<Vote>,
        source: NodeId,
        chain_size: u64,
    ) -> bool {
        let mut queue = self.queue.lock();
        let expected = queue
            .back()
            .map(|entry| entry.data.pbft_block.period() + 1)
            .unwrap_or(chain_size + 1);
        if data.pbft_block.period() != expected {
            return false;
        }
        queue.push_back(QueuedPeriod {
            data,
            cert_votes,
            source,
        });
        true
    }

    pub fn pop(&self) -> Option<QueuedPeriod> {
        self.queue.lock().pop_front()
    }

    pub fn size(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Highest queued period, if any.
    pub fn last_period(&self) -> Option<PbftPeriod> {
        self.queue
            .lock()
            .back()
            .map(|entry| entry.data.pbft_block.period())
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}
