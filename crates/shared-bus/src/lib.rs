//! # Node Event Bus
//!
//! Defines the observable events that flow between subsystems and to
//! external subscribers, with a broadcast-based fanout.
//!
//! Publishing never blocks: slow subscribers lag and eventually observe
//! `RecvError::Lagged`, which is acceptable for observability consumers.
//! Consensus-critical data never travels through the bus.

pub mod events;

pub use events::NodeEvent;

use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of the broadcast ring buffer.
const DEFAULT_CAPACITY: usize = 4096;

/// Broadcast fanout for [`NodeEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Lossy by design when
    /// nobody listens.
    pub fn publish(&self, event: NodeEvent) {
        trace!(?event, "bus publish");
        let _ = self.sender.send(event);
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(NodeEvent::TransactionAdded {
            trx_hash: B256::repeat_byte(0x01),
        });

        match rx.recv().await.unwrap() {
            NodeEvent::TransactionAdded { trx_hash } => {
                assert_eq!(trx_hash, B256::repeat_byte(0x01));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_lossy() {
        let bus = EventBus::new();
        // Must not panic or error.
        bus.publish(NodeEvent::PbftPeriodAdvanced { period: 1 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(NodeEvent::PbftPeriodAdvanced { period: 5 });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            NodeEvent::PbftPeriodAdvanced { period: 5 }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            NodeEvent::PbftPeriodAdvanced { period: 5 }
        ));
    }
}
