use std::fmt;

use crate::types::Hash256;

/// Storage-level error type.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying RocksDB error.
    RocksDb(rocksdb::Error),
    /// Required column family was not found.
    MissingColumnFamily(&'static str),
    /// Corrupted or malformed metadata (e.g. tip index with wrong length).
    CorruptedMeta(&'static str),
    /// A block could not be encoded for storage.
    Encode(String),
    /// A stored block could not be decoded.
    Decode(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::RocksDb(e)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::RocksDb(e) => write!(f, "rocksdb error: {e}"),
            StorageError::MissingColumnFamily(cf) => write!(f, "missing column family {cf:?}"),
            StorageError::CorruptedMeta(what) => write!(f, "corrupted metadata: {what}"),
            StorageError::Encode(msg) => write!(f, "failed to encode block: {msg}"),
            StorageError::Decode(msg) => write!(f, "failed to decode stored block: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// A broken invariant found while walking the chain.
///
/// These are diagnostics only: the ledger never repairs a chain, since a
/// repair would erase the very evidence of tampering.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityError {
    /// Chain has no genesis block.
    Empty,
    /// Genesis block does not have index 0, a zero parent and no records.
    MalformedGenesis,
    /// Block at `position` carries the wrong index.
    IndexMismatch { position: usize, index: u64 },
    /// Stored hash differs from the hash recomputed from contents.
    HashMismatch {
        index: u64,
        stored: Hash256,
        computed: Hash256,
    },
    /// `previous_hash` does not equal the prior block's stored hash.
    BrokenLink {
        index: u64,
        expected: Hash256,
        found: Hash256,
    },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::Empty => write!(f, "chain is empty"),
            IntegrityError::MalformedGenesis => write!(f, "malformed genesis block"),
            IntegrityError::IndexMismatch { position, index } => {
                write!(f, "block at position {position} has index {index}")
            }
            IntegrityError::HashMismatch {
                index,
                stored,
                computed,
            } => write!(
                f,
                "block {index}: stored hash {stored} != recomputed {computed}"
            ),
            IntegrityError::BrokenLink {
                index,
                expected,
                found,
            } => write!(
                f,
                "block {index}: previous_hash {found} does not link to {expected}"
            ),
        }
    }
}

impl std::error::Error for IntegrityError {}

/// High-level errors returned by the provenance ledger.
#[derive(Debug)]
pub enum LedgerError {
    Storage(StorageError),
    /// Persisted chain failed verification on open.
    Integrity(IntegrityError),
    /// Store tip points past a block that is not present.
    MissingBlock(u64),
    Export(String),
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        LedgerError::Storage(e)
    }
}

impl From<IntegrityError> for LedgerError {
    fn from(e: IntegrityError) -> Self {
        LedgerError::Integrity(e)
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Storage(e) => write!(f, "ledger storage error: {e}"),
            LedgerError::Integrity(e) => write!(f, "ledger integrity error: {e}"),
            LedgerError::MissingBlock(i) => write!(f, "ledger store is missing block {i}"),
            LedgerError::Export(msg) => write!(f, "ledger export failed: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}
