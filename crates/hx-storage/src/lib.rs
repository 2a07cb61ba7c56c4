//! # Node Storage
//!
//! RocksDB-backed persistence behind typed accessors.
//!
//! ## Guarantees
//!
//! - Column families isolate concerns (see [`Column`]).
//! - Multi-key writes go through [`DbBatch`] and commit atomically.
//! - Values are RLP for chain artifacts and bincode for local metadata.
//!
//! IO failures are surfaced as [`StorageError::Io`]; callers on
//! consensus-critical paths treat them as fatal.

pub mod columns;
pub mod migration;

pub use columns::Column;

use alloy_rlp::Decodable;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use shared_types::{
    BlockHash, DagBlock, Level, PbftHash, PbftPeriod, PeriodData, PillarBlock, PillarHash,
    PillarVote, SortitionConfig, Transaction, TrxHash, Vote, B256,
};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Database schema major version; bumping it triggers a rebuild cycle.
pub const DB_MAJOR_VERSION: u32 = 1;

const KEY_GENESIS_HASH: &[u8] = b"genesis_hash";
const KEY_MAJOR_VERSION: &[u8] = b"major_version";
const KEY_PBFT_HEAD: &[u8] = b"pbft_head";
const KEY_OWN_NEXT_VOTES: &[u8] = b"own_next_votes";
const KEY_DAG_BLOCKS_COUNT: &[u8] = b"dag_blocks_count";
const KEY_DAG_EDGES_COUNT: &[u8] = b"dag_edges_count";
const KEY_LATEST_PILLAR_PERIOD: &[u8] = b"latest_pillar_period";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database io failure: {0}")]
    Io(String),

    #[error("corrupt value in {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

type Result<T> = std::result::Result<T, StorageError>;

/// Persistent PBFT chain head record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftHead {
    pub last_block_hash: PbftHash,
    pub period: PbftPeriod,
    pub chain_size: u64,
}

/// One deferred write; batches of these commit atomically.
#[derive(Debug)]
enum BatchOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// An atomic multi-column write.
#[derive(Debug, Default)]
pub struct DbBatch {
    ops: Vec<BatchOp>,
}

impl DbBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn put_raw(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { column, key, value });
    }

    pub fn delete_raw(&mut self, column: Column, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { column, key });
    }

    pub fn put_dag_block(&mut self, block: &DagBlock) {
        self.put_raw(
            Column::DagBlocks,
            block.hash().to_vec(),
            alloy_rlp::encode(block),
        );
    }

    pub fn delete_dag_block(&mut self, hash: &BlockHash) {
        self.delete_raw(Column::DagBlocks, hash.to_vec());
    }

    pub fn put_level_index(&mut self, level: Level, hashes: &[BlockHash]) {
        if hashes.is_empty() {
            self.delete_raw(Column::DagBlocksLevel, u64_key(level).to_vec());
        } else {
            self.put_raw(
                Column::DagBlocksLevel,
                u64_key(level).to_vec(),
                alloy_rlp::encode(hashes.to_vec()),
            );
        }
    }

    pub fn delete_level_index(&mut self, level: Level) {
        self.delete_raw(Column::DagBlocksLevel, u64_key(level).to_vec());
    }

    pub fn put_transaction(&mut self, trx: &Transaction) {
        self.put_raw(
            Column::Transactions,
            trx.hash().to_vec(),
            alloy_rlp::encode(trx),
        );
    }

    pub fn put_trx_period(&mut self, hash: &TrxHash, period: PbftPeriod) {
        self.put_raw(Column::TrxPeriod, hash.to_vec(), u64_key(period).to_vec());
    }

    pub fn put_period_data(&mut self, data: &PeriodData) {
        let period = data.pbft_block.period();
        self.put_raw(
            Column::PeriodData,
            u64_key(period).to_vec(),
            alloy_rlp::encode(data),
        );
        self.put_raw(
            Column::PbftBlockPeriod,
            data.pbft_block.hash().to_vec(),
            u64_key(period).to_vec(),
        );
    }

    pub fn put_cert_votes(&mut self, block_hash: &PbftHash, votes: &[Vote]) {
        self.put_raw(
            Column::CertVotes,
            block_hash.to_vec(),
            alloy_rlp::encode(votes.to_vec()),
        );
    }

    pub fn put_pbft_head(&mut self, head: &PbftHead) {
        let value = bincode::serialize(head).expect("head record serializes");
        self.put_raw(Column::PbftHead, KEY_PBFT_HEAD.to_vec(), value);
    }

    pub fn put_finalized_order(&mut self, anchor: &BlockHash, order: &[BlockHash]) {
        self.put_raw(
            Column::DagFinalizedBlocks,
            anchor.to_vec(),
            alloy_rlp::encode(order.to_vec()),
        );
    }

    pub fn put_proposal_period_level(&mut self, max_level: Level, period: PbftPeriod) {
        self.put_raw(
            Column::ProposalPeriodLevels,
            u64_key(max_level).to_vec(),
            u64_key(period).to_vec(),
        );
    }

    pub fn put_pillar_block(&mut self, block: &PillarBlock) {
        self.put_raw(
            Column::PillarBlocks,
            u64_key(block.period()).to_vec(),
            alloy_rlp::encode(block),
        );
        self.put_raw(
            Column::Status,
            KEY_LATEST_PILLAR_PERIOD.to_vec(),
            u64_key(block.period()).to_vec(),
        );
    }

    pub fn put_pillar_votes(&mut self, pillar_hash: &PillarHash, votes: &[PillarVote]) {
        self.put_raw(
            Column::PillarVotes,
            pillar_hash.to_vec(),
            alloy_rlp::encode(votes.to_vec()),
        );
    }

    pub fn delete_pillar_votes(&mut self, pillar_hash: &PillarHash) {
        self.delete_raw(Column::PillarVotes, pillar_hash.to_vec());
    }

    pub fn put_sortition_params(&mut self, period: PbftPeriod, params: &SortitionConfig) {
        let value = bincode::serialize(params).expect("sortition record serializes");
        self.put_raw(Column::SortitionParamsChange, u64_key(period).to_vec(), value);
    }
}

/// RocksDB-backed node storage.
pub struct DbStorage {
    db: DB,
}

impl DbStorage {
    /// Open (or create) the database with all column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|column| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
                ColumnFamilyDescriptor::new(column.name(), cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)?;
        info!(path = %path.as_ref().display(), "database opened");
        Ok(Self { db })
    }

    /// Open read-only, used by the rebuild cycle.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let opts = Options::default();
        let names: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
        let db = DB::open_cf_for_read_only(&opts, path.as_ref(), names, false)?;
        Ok(Self { db })
    }

    fn cf(&self, column: Column) -> &rocksdb::ColumnFamily {
        // Every column is created in `open`; a miss is a programming error.
        self.db
            .cf_handle(column.name())
            .expect("column family exists")
    }

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(column), key)?)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put_cf(self.cf(column), key, value)?)
    }

    /// Commit a batch atomically.
    pub fn commit(&self, batch: DbBatch) -> Result<()> {
        let mut wb = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { column, key, value } => wb.put_cf(self.cf(column), key, value),
                BatchOp::Delete { column, key } => wb.delete_cf(self.cf(column), key),
            }
        }
        Ok(self.db.write(wb)?)
    }

    // =========================================================================
    // Genesis / version markers
    // =========================================================================

    pub fn genesis_hash(&self) -> Result<Option<BlockHash>> {
        Ok(self
            .get(Column::Genesis, KEY_GENESIS_HASH)?
            .map(|raw| B256::from_slice(&raw)))
    }

    pub fn set_genesis_hash(&self, hash: &BlockHash) -> Result<()> {
        self.put(Column::Genesis, KEY_GENESIS_HASH, hash.as_slice())
    }

    pub fn major_version(&self) -> Result<Option<u32>> {
        Ok(self
            .get(Column::Genesis, KEY_MAJOR_VERSION)?
            .map(|raw| u32::from_be_bytes(raw.try_into().unwrap_or_default())))
    }

    pub fn set_major_version(&self, version: u32) -> Result<()> {
        self.put(Column::Genesis, KEY_MAJOR_VERSION, &version.to_be_bytes())
    }

    // =========================================================================
    // DAG blocks
    // =========================================================================

    pub fn save_dag_block(&self, block: &DagBlock) -> Result<()> {
        self.put(
            Column::DagBlocks,
            block.hash().as_slice(),
            &alloy_rlp::encode(block),
        )
    }

    pub fn dag_block(&self, hash: &BlockHash) -> Result<Option<DagBlock>> {
        self.get(Column::DagBlocks, hash.as_slice())?
            .map(|raw| decode_value(Column::DagBlocks, &raw))
            .transpose()
    }

    pub fn dag_block_in_db(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self
            .db
            .get_pinned_cf(self.cf(Column::DagBlocks), hash.as_slice())?
            .is_some())
    }

    pub fn remove_dag_block(&self, hash: &BlockHash) -> Result<()> {
        Ok(self.db.delete_cf(self.cf(Column::DagBlocks), hash.as_slice())?)
    }

    /// Non-finalized DAG blocks grouped by level, for startup recovery.
    pub fn non_finalized_dag_blocks(&self) -> Result<BTreeMap<Level, Vec<DagBlock>>> {
        let mut result: BTreeMap<Level, Vec<DagBlock>> = BTreeMap::new();
        for item in self
            .db
            .iterator_cf(self.cf(Column::DagBlocksLevel), IteratorMode::Start)
        {
            let (key, value) = item?;
            let level = key_to_u64(&key);
            let hashes: Vec<BlockHash> = decode_value(Column::DagBlocksLevel, &value)?;
            let mut blocks = Vec::with_capacity(hashes.len());
            for hash in hashes {
                match self.dag_block(&hash)? {
                    Some(block) => blocks.push(block),
                    None => warn!(%hash, level, "level index references missing dag block"),
                }
            }
            result.insert(level, blocks);
        }
        Ok(result)
    }

    pub fn save_level_index(&self, level: Level, hashes: &[BlockHash]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(self
                .db
                .delete_cf(self.cf(Column::DagBlocksLevel), u64_key(level))?);
        }
        self.put(
            Column::DagBlocksLevel,
            &u64_key(level),
            &alloy_rlp::encode(hashes.to_vec()),
        )
    }

    pub fn finalized_order(&self, anchor: &BlockHash) -> Result<Option<Vec<BlockHash>>> {
        self.get(Column::DagFinalizedBlocks, anchor.as_slice())?
            .map(|raw| decode_value(Column::DagFinalizedBlocks, &raw))
            .transpose()
    }

    // =========================================================================
    // DAG counters
    // =========================================================================

    pub fn dag_blocks_count(&self) -> Result<u64> {
        self.counter(KEY_DAG_BLOCKS_COUNT)
    }

    pub fn dag_edges_count(&self) -> Result<u64> {
        self.counter(KEY_DAG_EDGES_COUNT)
    }

    pub fn add_dag_counts(&self, blocks: u64, edges: u64) -> Result<()> {
        self.put(
            Column::Status,
            KEY_DAG_BLOCKS_COUNT,
            &(self.dag_blocks_count()? + blocks).to_be_bytes(),
        )?;
        self.put(
            Column::Status,
            KEY_DAG_EDGES_COUNT,
            &(self.dag_edges_count()? + edges).to_be_bytes(),
        )
    }

    fn counter(&self, key: &[u8]) -> Result<u64> {
        Ok(self
            .get(Column::Status, key)?
            .map(|raw| u64::from_be_bytes(raw.try_into().unwrap_or_default()))
            .unwrap_or(0))
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn transaction(&self, hash: &TrxHash) -> Result<Option<Transaction>> {
        self.get(Column::Transactions, hash.as_slice())?
            .map(|raw| decode_value(Column::Transactions, &raw))
            .transpose()
    }

    pub fn save_transaction(&self, trx: &Transaction) -> Result<()> {
        self.put(
            Column::Transactions,
            trx.hash().as_slice(),
            &alloy_rlp::encode(trx),
        )
    }

    pub fn transaction_period(&self, hash: &TrxHash) -> Result<Option<PbftPeriod>> {
        Ok(self
            .get(Column::TrxPeriod, hash.as_slice())?
            .map(|raw| key_to_u64(&raw)))
    }

    /// For each hash: whether it is finalized in some period.
    pub fn transactions_finalized(&self, hashes: &[TrxHash]) -> Result<Vec<bool>> {
        hashes
            .iter()
            .map(|h| Ok(self.transaction_period(h)?.is_some()))
            .collect()
    }

    // =========================================================================
    // PBFT chain
    // =========================================================================

    pub fn pbft_head(&self) -> Result<Option<PbftHead>> {
        self.get(Column::PbftHead, KEY_PBFT_HEAD)?
            .map(|raw| {
                bincode::deserialize(&raw).map_err(|e| StorageError::Corrupt {
                    column: Column::PbftHead.name(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn period_data(&self, period: PbftPeriod) -> Result<Option<PeriodData>> {
        self.get(Column::PeriodData, &u64_key(period))?
            .map(|raw| decode_value(Column::PeriodData, &raw))
            .transpose()
    }

    pub fn pbft_block_hash_for_period(&self, period: PbftPeriod) -> Result<Option<PbftHash>> {
        Ok(self.period_data(period)?.map(|d| d.pbft_block.hash()))
    }

    pub fn period_for_pbft_block(&self, hash: &PbftHash) -> Result<Option<PbftPeriod>> {
        Ok(self
            .get(Column::PbftBlockPeriod, hash.as_slice())?
            .map(|raw| key_to_u64(&raw)))
    }

    pub fn cert_votes(&self, block_hash: &PbftHash) -> Result<Vec<Vote>> {
        Ok(self
            .get(Column::CertVotes, block_hash.as_slice())?
            .map(|raw| decode_value(Column::CertVotes, &raw))
            .transpose()?
            .unwrap_or_default())
    }

    pub fn save_own_next_votes(&self, votes: &[Vote]) -> Result<()> {
        self.put(
            Column::NextVotes,
            KEY_OWN_NEXT_VOTES,
            &alloy_rlp::encode(votes.to_vec()),
        )
    }

    pub fn own_next_votes(&self) -> Result<Vec<Vote>> {
        Ok(self
            .get(Column::NextVotes, KEY_OWN_NEXT_VOTES)?
            .map(|raw| decode_value(Column::NextVotes, &raw))
            .transpose()?
            .unwrap_or_default())
    }

    // =========================================================================
    // Proposal period ↔ DAG level map
    // =========================================================================

    pub fn save_proposal_period_level(&self, max_level: Level, period: PbftPeriod) -> Result<()> {
        self.put(
            Column::ProposalPeriodLevels,
            &u64_key(max_level),
            &u64_key(period),
        )
    }

    /// The proposal period whose level window covers `level`: the entry with
    /// the smallest `max_level >= level`.
    pub fn proposal_period_for_level(&self, level: Level) -> Result<Option<PbftPeriod>> {
        let iter = self.db.iterator_cf(
            self.cf(Column::ProposalPeriodLevels),
            IteratorMode::From(&u64_key(level), Direction::Forward),
        );
        for item in iter {
            let (_, value) = item?;
            return Ok(Some(key_to_u64(&value)));
        }
        Ok(None)
    }

    // =========================================================================
    // Pillar chain
    // =========================================================================

    pub fn pillar_block(&self, period: PbftPeriod) -> Result<Option<PillarBlock>> {
        self.get(Column::PillarBlocks, &u64_key(period))?
            .map(|raw| decode_value(Column::PillarBlocks, &raw))
            .transpose()
    }

    pub fn latest_pillar_block(&self) -> Result<Option<PillarBlock>> {
        match self.get(Column::Status, KEY_LATEST_PILLAR_PERIOD)? {
            Some(raw) => self.pillar_block(key_to_u64(&raw)),
            None => Ok(None),
        }
    }

    pub fn pillar_votes(&self, pillar_hash: &PillarHash) -> Result<Vec<PillarVote>> {
        Ok(self
            .get(Column::PillarVotes, pillar_hash.as_slice())?
            .map(|raw| decode_value(Column::PillarVotes, &raw))
            .transpose()?
            .unwrap_or_default())
    }

    // =========================================================================
    // Sortition params
    // =========================================================================

    pub fn sortition_params(&self, period: PbftPeriod) -> Result<Option<SortitionConfig>> {
        self.get(Column::SortitionParamsChange, &u64_key(period))?
            .map(|raw| {
                bincode::deserialize(&raw).map_err(|e| StorageError::Corrupt {
                    column: Column::SortitionParamsChange.name(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Light-node history pruning: drop period data for `[0, end_period]`,
    /// deleting contained DAG blocks below `dag_level_to_keep` and their
    /// transactions.
    pub fn clear_period_data_history(
        &self,
        end_period: PbftPeriod,
        dag_level_to_keep: Level,
    ) -> Result<()> {
        let mut batch = DbBatch::new();
        for period in 0..=end_period {
            let Some(data) = self.period_data(period)? else {
                continue;
            };
            for block in &data.dag_blocks {
                if block.level() < dag_level_to_keep {
                    batch.delete_dag_block(&block.hash());
                    for trx in block.trxs() {
                        batch.delete_raw(Column::Transactions, trx.to_vec());
                    }
                }
            }
            batch.delete_raw(Column::PeriodData, u64_key(period).to_vec());
        }
        if !batch.is_empty() {
            info!(end_period, dag_level_to_keep, "pruned period history");
            self.commit(batch)?;
        }
        Ok(())
    }

    /// Iterate every stored period in order, for the rebuild cycle.
    pub fn for_each_period(
        &self,
        mut f: impl FnMut(PeriodData) -> Result<()>,
    ) -> Result<()> {
        for item in self
            .db
            .iterator_cf(self.cf(Column::PeriodData), IteratorMode::Start)
        {
            let (_, value) = item?;
            f(decode_value(Column::PeriodData, &value)?)?;
        }
        Ok(())
    }
}

fn u64_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

fn key_to_u64(raw: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let len = raw.len().min(8);
    bytes[8 - len..].copy_from_slice(&raw[..len]);
    u64::from_be_bytes(bytes)
}

fn decode_value<T: Decodable>(column: Column, raw: &[u8]) -> Result<T> {
    T::decode(&mut &raw[..]).map_err(|e| StorageError::Corrupt {
        column: column.name(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::ecdsa::KeyPair;
    use shared_types::U256;
    use tempfile::TempDir;

    fn keypair() -> KeyPair {
        KeyPair::from_secret_bytes(&[0x66; 32]).unwrap()
    }

    fn open_temp() -> (TempDir, DbStorage) {
        let dir = TempDir::new().unwrap();
        let db = DbStorage::open(dir.path()).unwrap();
        (dir, db)
    }

    fn sample_dag_block(level: Level) -> DagBlock {
        DagBlock::new(
            B256::repeat_byte(0x01),
            level,
            0,
            vec![],
            vec![],
            0,
            shared_crypto::vdf::VdfSortition {
                vrf_proof: shared_crypto::vrf::VrfProof::from_bytes([0u8; 65]),
                difficulty: 0,
                output: B256::ZERO,
            },
            &keypair(),
        )
        .unwrap()
    }

    #[test]
    fn test_dag_block_roundtrip() {
        let (_dir, db) = open_temp();
        let block = sample_dag_block(3);

        db.save_dag_block(&block).unwrap();
        assert!(db.dag_block_in_db(&block.hash()).unwrap());

        let loaded = db.dag_block(&block.hash()).unwrap().unwrap();
        assert_eq!(loaded.hash(), block.hash());

        db.remove_dag_block(&block.hash()).unwrap();
        assert!(!db.dag_block_in_db(&block.hash()).unwrap());
    }

    #[test]
    fn test_batch_commit_is_atomic_across_columns() {
        let (_dir, db) = open_temp();
        let block = sample_dag_block(1);
        let trx = Transaction::new(
            0,
            U256::ZERO,
            U256::from(1u64),
            21_000,
            None,
            Default::default(),
            842,
            &keypair(),
        )
        .unwrap();

        let mut batch = DbBatch::new();
        batch.put_dag_block(&block);
        batch.put_transaction(&trx);
        batch.put_trx_period(&trx.hash(), 7);
        db.commit(batch).unwrap();

        assert!(db.dag_block_in_db(&block.hash()).unwrap());
        assert_eq!(db.transaction_period(&trx.hash()).unwrap(), Some(7));
        assert_eq!(
            db.transactions_finalized(&[trx.hash(), B256::ZERO]).unwrap(),
            vec![true, false]
        );
    }

    #[test]
    fn test_level_index_recovery() {
        let (_dir, db) = open_temp();
        let b1 = sample_dag_block(1);
        let b2 = sample_dag_block(2);
        db.save_dag_block(&b1).unwrap();
        db.save_dag_block(&b2).unwrap();
        db.save_level_index(1, &[b1.hash()]).unwrap();
        db.save_level_index(2, &[b2.hash()]).unwrap();

        let recovered = db.non_finalized_dag_blocks().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[&1][0].hash(), b1.hash());
        assert_eq!(recovered[&2][0].hash(), b2.hash());

        // Clearing a level removes it from recovery.
        db.save_level_index(1, &[]).unwrap();
        assert_eq!(db.non_finalized_dag_blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_proposal_period_level_lookup() {
        let (_dir, db) = open_temp();
        db.save_proposal_period_level(100, 0).unwrap();
        db.save_proposal_period_level(250, 1).unwrap();
        db.save_proposal_period_level(400, 2).unwrap();

        assert_eq!(db.proposal_period_for_level(0).unwrap(), Some(0));
        assert_eq!(db.proposal_period_for_level(100).unwrap(), Some(0));
        assert_eq!(db.proposal_period_for_level(101).unwrap(), Some(1));
        assert_eq!(db.proposal_period_for_level(400).unwrap(), Some(2));
        assert_eq!(db.proposal_period_for_level(401).unwrap(), None);
    }

    #[test]
    fn test_pbft_head_roundtrip() {
        let (_dir, db) = open_temp();
        assert!(db.pbft_head().unwrap().is_none());

        let head = PbftHead {
            last_block_hash: B256::repeat_byte(0x09),
            period: 12,
            chain_size: 12,
        };
        let mut batch = DbBatch::new();
        batch.put_pbft_head(&head);
        db.commit(batch).unwrap();

        assert_eq!(db.pbft_head().unwrap(), Some(head));
    }

    #[test]
    fn test_genesis_hash_marker() {
        let (_dir, db) = open_temp();
        assert!(db.genesis_hash().unwrap().is_none());
        db.set_genesis_hash(&B256::repeat_byte(0x42)).unwrap();
        assert_eq!(db.genesis_hash().unwrap(), Some(B256::repeat_byte(0x42)));
    }

    #[test]
    fn test_counters_accumulate() {
        let (_dir, db) = open_temp();
        db.add_dag_counts(3, 5).unwrap();
        db.add_dag_counts(2, 1).unwrap();
        assert_eq!(db.dag_blocks_count().unwrap(), 5);
        assert_eq!(db.dag_edges_count().unwrap(), 6);
    }
}
