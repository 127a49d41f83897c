//! Persistence layer — the dedup ledger over libSQL.

pub mod ledger;

pub use ledger::{DedupLedger, LedgerRow};
