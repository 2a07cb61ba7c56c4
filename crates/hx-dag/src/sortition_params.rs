//! Per-period sortition parameters.
//!
//! VDF difficulty bounds may change over the chain's lifetime; each change
//! is persisted keyed by the first period it applies to, and lookups answer
//! with the newest change at or before the queried period.

use hx_storage::{DbBatch, DbStorage};
use shared_crypto::vdf::VdfParams;
use shared_types::{PbftPeriod, SortitionConfig};
use std::sync::Arc;

pub struct SortitionParamsManager {
    genesis_params: SortitionConfig,
    db: Arc<DbStorage>,
}

impl SortitionParamsManager {
    pub fn new(genesis_params: SortitionConfig, db: Arc<DbStorage>) -> Self {
        Self { genesis_params, db }
    }

    /// Parameters in force at `period`.
    pub fn params_for_period(&self, period: PbftPeriod) -> VdfParams {
        // Walk back to the latest recorded change; absent any, genesis rules.
        let mut p = period;
        loop {
            if let Ok(Some(config)) = self.db.sortition_params(p) {
                return VdfParams::from(&config);
            }
            if p == 0 {
                break;
            }
            p -= 1;
        }
        VdfParams::from(&self.genesis_params)
    }

    /// Record a parameter change taking effect at `period`.
    pub fn record_change(&self, period: PbftPeriod, config: &SortitionConfig, batch: &mut DbBatch) {
        batch.put_sortition_params(period, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_genesis_params_by_default() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(DbStorage::open(dir.path()).unwrap());
        let mgr = SortitionParamsManager::new(SortitionConfig::default(), db);

        let params = mgr.params_for_period(5);
        assert_eq!(params.difficulty_min, SortitionConfig::default().difficulty_min);
    }

    #[test]
    fn test_recorded_change_applies_from_its_period() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(DbStorage::open(dir.path()).unwrap());
        let mgr = SortitionParamsManager::new(SortitionConfig::default(), db.clone());

        let mut changed = SortitionConfig::default();
        changed.difficulty_min = 9;
        let mut batch = DbBatch::new();
        mgr.record_change(10, &changed, &mut batch);
        db.commit(batch).unwrap();

        assert_ne!(mgr.params_for_period(9).difficulty_min, 9);
        assert_eq!(mgr.params_for_period(10).difficulty_min, 9);
        assert_eq!(mgr.params_for_period(25).difficulty_min, 9);
    }
}
