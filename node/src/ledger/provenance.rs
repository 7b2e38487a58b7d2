//! Append-only provenance ledger.
//!
//! Completed inferences are buffered as pending [`InferenceRecord`]s and
//! sealed in fixed-size batches into hash-linked [`Block`]s. Every sealed
//! block is written through to a [`LedgerStore`] before it becomes part of
//! the in-memory chain, so a node restarted on a durable store resumes from
//! the same chain (re-verified on open).

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::types::{Block, Hash256, InferenceRecord, unix_now};

use super::error::{IntegrityError, LedgerError};
use super::store::LedgerStore;

/// Ledger tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerConfig {
    /// Leading zero hex characters required of a sealed block hash.
    pub difficulty: usize,
    /// Pending records that trigger an automatic seal.
    pub records_per_block: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: 2,
            records_per_block: 10,
        }
    }
}

/// Aggregate statistics over all sealed records.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total_inferences: u64,
    pub total_energy_joules: f64,
    pub total_tokens_generated: u64,
    pub avg_latency_ms: f64,
    pub avg_energy_per_inference_mj: f64,
    pub unique_nodes: usize,
    pub unique_models: usize,
    pub chain_length: usize,
    pub pending_records: usize,
    pub chain_valid: bool,
}

/// Exported view of a block: hashes as hex, records inlined.
#[derive(Serialize)]
struct ExportedBlock<'a> {
    index: u64,
    timestamp: f64,
    hash: &'a Hash256,
    previous_hash: &'a Hash256,
    contributor_id: &'a str,
    records: &'a [InferenceRecord],
}

pub struct ProvenanceLedger<S> {
    chain: Vec<Block>,
    pending: Vec<InferenceRecord>,
    config: LedgerConfig,
    contributor_id: String,
    store: S,
}

impl<S: LedgerStore> ProvenanceLedger<S> {
    /// Opens the ledger on `store`.
    ///
    /// An empty store gets a fresh genesis block. A non-empty store is
    /// loaded block by block up to its tip and verified; a chain that fails
    /// verification is reported, not repaired.
    pub fn open(
        mut store: S,
        config: LedgerConfig,
        contributor_id: impl Into<String>,
    ) -> Result<Self, LedgerError> {
        let chain = match store.tip()? {
            None => {
                let genesis = Block::genesis(unix_now());
                store.put_block(&genesis)?;
                store.set_tip(0)?;
                debug!(hash = %genesis.hash, "created genesis block");
                vec![genesis]
            }
            Some(tip) => {
                let mut chain = Vec::with_capacity(tip as usize + 1);
                for index in 0..=tip {
                    let block = store
                        .get_block(index)?
                        .ok_or(LedgerError::MissingBlock(index))?;
                    chain.push(block);
                }
                info!(blocks = chain.len(), "loaded ledger from store");
                chain
            }
        };

        let ledger = Self {
            chain,
            pending: Vec::new(),
            config,
            contributor_id: contributor_id.into(),
            store,
        };
        ledger.verify_chain_detailed()?;
        Ok(ledger)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn last_block(&self) -> &Block {
        // `open` guarantees at least the genesis block.
        &self.chain[self.chain.len() - 1]
    }

    pub fn pending_records(&self) -> &[InferenceRecord] {
        &self.pending
    }

    /// Buffers a record and returns its hash. Seals a block under this
    /// ledger's contributor id once the batch size is reached.
    pub fn add_record(&mut self, record: InferenceRecord) -> Result<Hash256, LedgerError> {
        let record_hash = record.to_hash();
        self.pending.push(record);

        if self.pending.len() >= self.config.records_per_block {
            let contributor = self.contributor_id.clone();
            self.seal_pending_block(&contributor)?;
        }
        Ok(record_hash)
    }

    /// Seals up to one batch of pending records into a new block.
    ///
    /// Returns `Ok(None)` when nothing is pending. Pending records are only
    /// drained after the block has been persisted.
    pub fn seal_pending_block(&mut self, contributor_id: &str) -> Result<Option<Block>, LedgerError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let take = self.pending.len().min(self.config.records_per_block);
        let last = self.last_block();
        let mut block = Block {
            index: last.index + 1,
            timestamp: unix_now(),
            records: self.pending[..take].to_vec(),
            previous_hash: last.hash,
            nonce: 0,
            contributor_id: contributor_id.to_string(),
            hash: Hash256::ZERO,
        };
        block.seal(self.config.difficulty);

        self.store.put_block(&block)?;
        self.store.set_tip(block.index)?;

        self.pending.drain(..take);
        self.chain.push(block.clone());
        info!(
            index = block.index,
            records = block.records.len(),
            nonce = block.nonce,
            hash = %block.hash,
            "sealed ledger block"
        );
        Ok(Some(block))
    }

    /// Returns `true` if no tampering is detected.
    pub fn verify_chain(&self) -> bool {
        self.verify_chain_detailed().is_ok()
    }

    /// Walks the chain and reports the first broken invariant.
    pub fn verify_chain_detailed(&self) -> Result<(), IntegrityError> {
        let genesis = self.chain.first().ok_or(IntegrityError::Empty)?;
        if genesis.index != 0 || genesis.previous_hash != Hash256::ZERO || !genesis.records.is_empty()
        {
            return Err(IntegrityError::MalformedGenesis);
        }

        for (position, pair) in self.chain.windows(2).enumerate() {
            let (previous, current) = (&pair[0], &pair[1]);
            if current.index != position as u64 + 1 {
                return Err(IntegrityError::IndexMismatch {
                    position: position + 1,
                    index: current.index,
                });
            }

            let computed = current.compute_hash();
            if current.hash != computed {
                return Err(IntegrityError::HashMismatch {
                    index: current.index,
                    stored: current.hash,
                    computed,
                });
            }

            if current.previous_hash != previous.hash {
                return Err(IntegrityError::BrokenLink {
                    index: current.index,
                    expected: previous.hash,
                    found: current.previous_hash,
                });
            }
        }
        Ok(())
    }

    fn sealed_records(&self) -> impl Iterator<Item = &InferenceRecord> {
        self.chain.iter().flat_map(|b| b.records.iter())
    }

    pub fn get_record_by_hash(&self, record_hash: &Hash256) -> Option<&InferenceRecord> {
        self.sealed_records().find(|r| &r.to_hash() == record_hash)
    }

    pub fn get_records_by_node(&self, node_id: &str) -> Vec<&InferenceRecord> {
        self.sealed_records()
            .filter(|r| r.node_ids.iter().any(|n| n == node_id))
            .collect()
    }

    pub fn get_records_by_model(&self, model_id: &str) -> Vec<&InferenceRecord> {
        self.sealed_records()
            .filter(|r| r.model_id == model_id)
            .collect()
    }

    pub fn get_network_stats(&self) -> LedgerStats {
        let mut total_inferences = 0u64;
        let mut total_energy_mj = 0u64;
        let mut total_tokens = 0u64;
        let mut total_latency_ms = 0u64;
        let mut nodes = BTreeSet::new();
        let mut models = BTreeSet::new();

        for record in self.sealed_records() {
            total_inferences += 1;
            total_energy_mj += record.energy_mj;
            total_tokens += u64::from(record.tokens_generated);
            total_latency_ms += record.latency_ms;
            nodes.extend(record.node_ids.iter().map(String::as_str));
            models.insert(record.model_id.as_str());
        }

        let denom = total_inferences.max(1) as f64;
        LedgerStats {
            total_inferences,
            total_energy_joules: total_energy_mj as f64 / 1000.0,
            total_tokens_generated: total_tokens,
            avg_latency_ms: total_latency_ms as f64 / denom,
            avg_energy_per_inference_mj: total_energy_mj as f64 / denom,
            unique_nodes: nodes.len(),
            unique_models: models.len(),
            chain_length: self.chain.len(),
            pending_records: self.pending.len(),
            chain_valid: self.verify_chain(),
        }
    }

    /// Exports the full chain as a pretty-printed JSON array.
    pub fn export_chain(&self) -> Result<String, LedgerError> {
        let blocks: Vec<ExportedBlock<'_>> = self
            .chain
            .iter()
            .map(|b| ExportedBlock {
                index: b.index,
                timestamp: b.timestamp,
                hash: &b.hash,
                previous_hash: &b.previous_hash,
                contributor_id: &b.contributor_id,
                records: &b.records,
            })
            .collect();
        serde_json::to_string_pretty(&blocks).map_err(|e| LedgerError::Export(e.to_string()))
    }
}
