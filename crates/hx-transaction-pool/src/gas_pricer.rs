//! Rolling gas price bid.
//!
//! Tracks the gas prices of recently finalized transactions and bids a low
//! percentile of them, floored at the configured minimum. New transactions
//! below the bid are refused admission.

use parking_lot::RwLock;
use shared_types::U256;
use std::collections::VecDeque;

/// Percentile of the rolling window used as the bid (1-in-4 cheapest).
const BID_PERCENTILE: usize = 25;

#[derive(Debug)]
pub struct GasPricer {
    minimum: U256,
    window: usize,
    recent: RwLock<VecDeque<U256>>,
}

impl GasPricer {
    pub fn new(minimum: U256, window: usize) -> Self {
        Self {
            minimum,
            window: window.max(1),
            recent: RwLock::new(VecDeque::new()),
        }
    }

    /// Record gas prices from a finalized period.
    pub fn on_finalized(&self, prices: impl IntoIterator<Item = U256>) {
        let mut recent = self.recent.write();
        for price in prices {
            if recent.len() == self.window {
                recent.pop_front();
            }
            recent.push_back(price);
        }
    }

    /// The current minimum acceptable gas price.
    pub fn bid(&self) -> U256 {
        let recent = self.recent.read();
        if recent.is_empty() {
            return self.minimum;
        }
        let mut sorted: Vec<U256> = recent.iter().copied().collect();
        sorted.sort();
        let index = (sorted.len() - 1) * BID_PERCENTILE / 100;
        sorted[index].max(self.minimum)
    }
}
