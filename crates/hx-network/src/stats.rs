//! Per-period packet statistics.
//!
//! Counters accumulate between `log_and_reset` calls (driven by the
//! node's periodic task) and surface processing and queueing latency
//! maxima per packet type through the log.

use crate::packet::PacketType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Clone)]
struct TypeStats {
    count: u64,
    total_processing: Duration,
    max_processing: Duration,
    max_queueing: Duration,
}

#[derive(Default)]
pub struct PacketsStats {
    by_type: Mutex<HashMap<PacketType, TypeStats>>,
}

impl PacketsStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, packet_type: PacketType, queueing: Duration, processing: Duration) {
        let mut by_type = self.by_type.lock();
        let entry = by_type.entry(packet_type).or_default();
        entry.count += 1;
        entry.total_processing += processing;
        entry.max_processing = entry.max_processing.max(processing);
        entry.max_queueing = entry.max_queueing.max(queueing);
    }

    /// Emit the period summary and start a fresh window.
    pub fn log_and_reset(&self) {
        let stats = std::mem::take(&mut *self.by_type.lock());
        for (packet_type, entry) in stats {
            info!(
                ?packet_type,
                count = entry.count,
                avg_processing_us = (entry.total_processing.as_micros() as u64)
                    .checked_div(entry.count)
                    .unwrap_or(0),
                max_processing_us = entry.max_processing.as_micros() as u64,
                max_queueing_us = entry.max_queueing.as_micros() as u64,
                "packet stats"
            );
        }
    }

    pub fn count(&self, packet_type: PacketType) -> u64 {
        self.by_type
            .lock()
            .get(&packet_type)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let stats = PacketsStats::new();
        stats.record(
            PacketType::Vote,
            Duration::from_micros(10),
            Duration::from_micros(50),
        );
        stats.record(
            PacketType::Vote,
            Duration::from_micros(20),
            Duration::from_micros(30),
        );
        assert_eq!(stats.count(PacketType::Vote), 2);
        assert_eq!(stats.count(PacketType::Status), 0);

        stats.log_and_reset();
        assert_eq!(stats.count(PacketType::Vote), 0);
    }
}
