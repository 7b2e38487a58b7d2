//! Storage abstraction used by the provenance ledger.

use crate::types::Block;

use super::error::StorageError;

/// Abstract storage interface used by the ledger.
///
/// Implementations can be backed by in-memory maps, RocksDB, etc. The
/// interface is intentionally small: the ledger only needs get/put by
/// block index and a notion of the current tip.
pub trait LedgerStore {
    /// Fetches a block by index, if present.
    fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError>;

    /// Persists a sealed block.
    fn put_block(&mut self, block: &Block) -> Result<(), StorageError>;

    /// Returns the index of the last persisted block, if any.
    fn tip(&self) -> Result<Option<u64>, StorageError>;

    /// Updates the index of the last persisted block.
    fn set_tip(&mut self, index: u64) -> Result<(), StorageError>;
}

/// Boxed store, used by nodes that pick the backend at runtime.
pub type DynLedgerStore = Box<dyn LedgerStore + Send + Sync>;

impl<S: LedgerStore + ?Sized> LedgerStore for Box<S> {
    fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        (**self).get_block(index)
    }

    fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        (**self).put_block(block)
    }

    fn tip(&self) -> Result<Option<u64>, StorageError> {
        (**self).tip()
    }

    fn set_tip(&mut self, index: u64) -> Result<(), StorageError> {
        (**self).set_tip(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal dummy store; good for checking trait-object use and basic
    /// tip semantics without caring about real blocks.
    #[derive(Default)]
    struct DummyStore {
        tip: Option<u64>,
    }

    impl LedgerStore for DummyStore {
        fn get_block(&self, _index: u64) -> Result<Option<Block>, StorageError> {
            Ok(None)
        }

        fn put_block(&mut self, _block: &Block) -> Result<(), StorageError> {
            Ok(())
        }

        fn tip(&self) -> Result<Option<u64>, StorageError> {
            Ok(self.tip)
        }

        fn set_tip(&mut self, index: u64) -> Result<(), StorageError> {
            self.tip = Some(index);
            Ok(())
        }
    }

    #[test]
    fn ledger_store_trait_is_object_safe() {
        let mut store: DynLedgerStore = Box::new(DummyStore::default());
        assert_eq!(store.tip().unwrap(), None);

        store.set_tip(3).unwrap();
        assert_eq!(store.tip().unwrap(), Some(3));
    }
}
