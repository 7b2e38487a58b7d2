//! Provenance ledger: a hash-chained, tamper-evident record of completed
//! inferences, plus the storage trait its backends implement.

pub mod error;
pub mod provenance;
pub mod store;

pub use error::{IntegrityError, LedgerError, StorageError};
pub use provenance::{LedgerConfig, LedgerStats, ProvenanceLedger};
pub use store::{DynLedgerStore, LedgerStore};
