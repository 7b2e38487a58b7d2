//! In-memory ledger store.

use std::collections::BTreeMap;

use crate::ledger::{LedgerStore, StorageError};
use crate::types::Block;

/// In-memory implementation of [`LedgerStore`], keyed by block index.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    blocks: BTreeMap<u64, Block>,
    tip: Option<u64>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.blocks.get(&index).cloned())
    }

    fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.index, block.clone());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_by_index() {
        let mut store = InMemoryLedgerStore::new();
        let genesis = Block::genesis(1_700_000_000.0);

        store.put_block(&genesis).unwrap();
        let fetched = store.get_block(0).unwrap().expect("genesis present");

        assert_eq!(fetched, genesis);
        assert_eq!(store.len(), 1);
        assert!(store.get_block(1).unwrap().is_none());
    }

    #[test]
    fn tip_is_tracked_separately_from_blocks() {
        let mut store = InMemoryLedgerStore::new();
        store.put_block(&Block::genesis(0.0)).unwrap();
        assert!(store.tip().unwrap().is_none());

        store.set_tip(0).unwrap();
        assert_eq!(store.tip().unwrap(), Some(0));
    }
}
