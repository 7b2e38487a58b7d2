//! Storage backends for the provenance ledger.
//!
//! Both implement [`crate::ledger::LedgerStore`]:
//!
//! - [`mem::InMemoryLedgerStore`] keeps blocks in memory (tests, ephemeral
//!   nodes),
//! - [`rocksdb::RocksDbLedgerStore`] persists them so a restarted node can
//!   reload and re-verify its chain.

pub mod mem;
pub mod rocksdb;

pub use mem::InMemoryLedgerStore;
pub use rocksdb::{RocksDbConfig, RocksDbLedgerStore};
