// Lattice ledger common library - main library exports

pub mod crypto;
pub mod hash;
pub mod ledger;
pub mod types;

// Flattened re-exports
pub use self::hash::*;
pub use self::ledger::*;
pub use self::types::*;
