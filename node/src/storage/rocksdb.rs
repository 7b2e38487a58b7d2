//! RocksDB-backed ledger store.
//!
//! Column families:
//!
//! - `"blocks"`: big-endian `u64` index -> bincode-encoded [`Block`],
//! - `"meta"`:   the tip index under the fixed key `"tip"`.
//!
//! Keys are big-endian so RocksDB iteration order matches chain order.

use std::path::Path;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};

use crate::ledger::{LedgerStore, StorageError};
use crate::types::Block;

const CF_BLOCKS: &str = "blocks";
const CF_META: &str = "meta";
const TIP_KEY: &[u8] = b"tip";

/// Configuration for [`RocksDbLedgerStore`].
#[derive(Clone, Debug, PartialEq)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Create the database and missing column families when absent.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/ledger-db".to_string(),
            create_if_missing: true,
        }
    }
}

/// RocksDB-backed implementation of [`LedgerStore`].
pub struct RocksDbLedgerStore {
    db: DB,
}

impl RocksDbLedgerStore {
    /// Opens (or creates) the store at `cfg.path`.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let cfs = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, Path::new(&cfg.path), cfs)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    fn encode_block(block: &Block) -> Result<Vec<u8>, StorageError> {
        let cfg = bincode::config::standard();
        bincode::serde::encode_to_vec(block, cfg).map_err(|e| StorageError::Encode(e.to_string()))
    }

    fn decode_block(bytes: &[u8]) -> Result<Block, StorageError> {
        let cfg = bincode::config::standard();
        let (block, _): (Block, usize) = bincode::serde::decode_from_slice(bytes, cfg)
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        Ok(block)
    }
}

impl LedgerStore for RocksDbLedgerStore {
    fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(cf, index.to_be_bytes())? {
            Some(bytes) => Self::decode_block(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        let bytes = Self::encode_block(block)?;
        let cf = self.cf(CF_BLOCKS)?;
        self.db.put_cf(cf, block.index.to_be_bytes(), bytes)?;
        Ok(())
    }

    fn tip(&self) -> Result<Option<u64>, StorageError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, TIP_KEY)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::CorruptedMeta("tip index length"))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
        }
    }

    fn set_tip(&mut self, index: u64) -> Result<(), StorageError> {
        let cf = self.cf(CF_META)?;
        self.db.put_cf(cf, TIP_KEY, index.to_be_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cfg(tmp: &TempDir) -> RocksDbConfig {
        RocksDbConfig {
            path: tmp.path().to_string_lossy().to_string(),
            create_if_missing: true,
        }
    }

    #[test]
    fn rocksdb_store_roundtrip_block_and_tip() {
        let tmp = TempDir::new().expect("create temp dir");
        let mut store = RocksDbLedgerStore::open(&cfg(&tmp)).expect("open RocksDB");

        let genesis = Block::genesis(1_700_000_000.0);
        store.put_block(&genesis).unwrap();
        store.set_tip(0).unwrap();

        let fetched = store.get_block(0).unwrap().expect("block should exist");
        assert_eq!(fetched, genesis);
        assert_eq!(store.tip().unwrap(), Some(0));
    }

    #[test]
    fn data_survives_reopen() {
        let tmp = TempDir::new().expect("create temp dir");
        {
            let mut store = RocksDbLedgerStore::open(&cfg(&tmp)).expect("open RocksDB");
            store.put_block(&Block::genesis(1.0)).unwrap();
            store.set_tip(0).unwrap();
        }

        let store = RocksDbLedgerStore::open(&cfg(&tmp)).expect("reopen RocksDB");
        assert_eq!(store.tip().unwrap(), Some(0));
        assert!(store.get_block(0).unwrap().is_some());
    }
}
