//! Lattice ledger store module
//! Reference persisted ledger: chains, cascading delete and verification

pub mod configuration;
pub mod ledger_verifier;
pub mod memory_ledger;

pub use configuration::LedgerConfig;
pub use ledger_verifier::LedgerVerifier;
pub use memory_ledger::{LedgerStats, MemoryLedger};
