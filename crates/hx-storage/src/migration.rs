//! Database rebuild cycle.
//!
//! A major schema version bump invalidates derived state but never the
//! canonical period history. The rebuild opens the old database read-only
//! and replays every stored period into a freshly created database; the
//! caller supplies the replay hook that re-executes each period against the
//! state bridge.

use crate::{DbBatch, DbStorage, StorageError, DB_MAJOR_VERSION};
use shared_types::PeriodData;
use tracing::info;

/// Whether the database at hand requires a rebuild before use.
pub fn needs_rebuild(db: &DbStorage) -> Result<bool, StorageError> {
    match db.major_version()? {
        None => Ok(false),
        Some(version) => Ok(version != DB_MAJOR_VERSION),
    }
}

/// Replay all periods from `old` into `fresh`.
///
/// `replay` receives each period in order together with the batch its
/// artifacts are committed in, and may append execution results (state
/// metadata) of its own.
pub fn rebuild<F>(old: &DbStorage, fresh: &DbStorage, mut replay: F) -> Result<u64, StorageError>
where
    F: FnMut(&PeriodData, &mut DbBatch) -> Result<(), StorageError>,
{
    let mut periods = 0u64;
    old.for_each_period(|data| {
        let mut batch = DbBatch::new();
        batch.put_period_data(&data);
        for block in &data.dag_blocks {
            batch.put_dag_block(block);
        }
        for trx in &data.transactions {
            batch.put_transaction(trx);
            batch.put_trx_period(&trx.hash(), data.pbft_block.period());
        }
        replay(&data, &mut batch)?;
        fresh.commit(batch)?;
        periods += 1;
        Ok(())
    })?;

    if let Some(genesis) = old.genesis_hash()? {
        fresh.set_genesis_hash(&genesis)?;
    }
    fresh.set_major_version(DB_MAJOR_VERSION)?;
    info!(periods, "database rebuild complete");
    Ok(periods)
}
