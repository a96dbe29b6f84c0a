//! Error types for block pool operations.

use lattice_common::{Address, ChainTarget, HashHeight, VerifyError};

use crate::candidate_chain::ChainId;

/// Errors returned by [`BlockPool`](crate::BlockPool) operations.
///
/// Missing dependencies are never errors; they keep a block pending.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A block does not follow the head it is attached to.
    #[error("block {got} does not follow {expected}")]
    LinkMismatch { expected: HashHeight, got: HashHeight },

    /// The verifier rejected the block.
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),

    /// The block was stamped before the latest reorganisation.
    #[error("stale fork version: stamped {stamped}, now {current}")]
    StaleForkVersion { stamped: u64, current: u64 },

    /// No common ancestor with `current` within the retained window.
    #[error("no common ancestor for {target} above height {floor}, deep resync required")]
    NeedsDeepResync { target: HashHeight, floor: u64 },

    /// A chain switch was requested without first rolling back to the fork point.
    #[error("fork point {key_point} lies below disk head {disk_head}")]
    ForkBelowDisk {
        key_point: HashHeight,
        disk_head: HashHeight,
    },

    #[error("chain {0} is not in the pool")]
    ChainNotFound(ChainId),

    /// Direct insertion needs an empty pending chain.
    #[error("{target} still has {pending} pending blocks")]
    PendingNotEmpty { target: ChainTarget, pending: usize },

    #[error("block of {got} submitted to pool of {expected}")]
    AddressMismatch { expected: Address, got: Address },

    /// The store refused a write or delete.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A previous storage failure stopped the pool.
    #[error("pool halted: {0}")]
    Halted(String),
}

impl PoolError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        PoolError::Storage(format!("{err:#}"))
    }
}
