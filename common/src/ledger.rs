//! Narrow capabilities the block pool consumes from the rest of the node.
//!
//! The persisted store is the single source of truth; the pool only
//! reads it through [`ChainReader`], mutates it through [`Writer`] and
//! asks [`Verifier`] whether a block may be applied on top of it.
//! Outbound traffic goes through [`Fetcher`] and [`Broadcaster`], both
//! fire-and-forget so no network I/O ever runs under a pool lock.

use crate::hash::{Address, BlockHash};
use crate::types::{AccountBlock, ChainTarget, DeletedBlocks, HashHeight, SnapshotBlock};
use anyhow::Result;

/// Reasons a block is rejected by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Sealed hash does not match the block content.
    #[error("hash mismatch: sealed {sealed}, computed {computed}")]
    HashMismatch {
        sealed: BlockHash,
        computed: BlockHash,
    },

    /// Block is not the direct successor of the persisted head.
    #[error("block {block} does not extend persisted head {head}")]
    NotExtendingHead { block: HashHeight, head: HashHeight },

    /// Referenced snapshot is not persisted.
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(BlockHash),

    /// Receive names a send block that is not persisted.
    #[error("unknown send block {0}")]
    UnknownSend(HashHeight),

    /// Receive names a block that is not a send addressed to the receiver.
    #[error("block {send} is not a send from {from} to {to}")]
    NotASendTo {
        send: HashHeight,
        from: Address,
        to: Address,
    },

    /// Send block is already matched by another receive.
    #[error("send {send} already received at {receiver}:{height}")]
    AlreadyReceived {
        send: HashHeight,
        receiver: Address,
        height: u64,
    },

    /// Snapshot confirms an account block that is not persisted.
    #[error("snapshot confirms missing block {head} of {address}")]
    ContentMissing { address: Address, head: HashHeight },

    /// Snapshot confirms a lower account height than an earlier snapshot.
    #[error("snapshot moves {address} back from {confirmed} to {proposed}")]
    ContentRegression {
        address: Address,
        confirmed: u64,
        proposed: u64,
    },

    /// Snapshot names another block at a height that is already confirmed.
    #[error("snapshot names {proposed} of {address} against its confirmed block at {confirmed}")]
    ContentConflict {
        address: Address,
        confirmed: u64,
        proposed: HashHeight,
    },

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Read access to persisted chains.
pub trait ChainReader: Send + Sync {
    /// Head of the snapshot chain, genesis if empty.
    fn head_snapshot(&self) -> HashHeight;

    fn snapshot_block_at(&self, height: u64) -> Option<SnapshotBlock>;

    fn get_snapshot_block_by_hash(&self, hash: &BlockHash) -> Option<SnapshotBlock>;

    /// Head of an account chain, genesis if the account is unknown.
    fn account_head(&self, address: &Address) -> HashHeight;

    fn account_block_at(&self, address: &Address, height: u64) -> Option<AccountBlock>;

    fn get_account_block_by_hash(&self, hash: &BlockHash) -> Option<AccountBlock>;

    /// Lowest block of `address` not confirmed by any snapshot up to
    /// and including `snapshot`.
    fn get_first_unconfirmed_block(
        &self,
        address: &Address,
        snapshot: &HashHeight,
    ) -> Option<AccountBlock>;

    /// All persisted blocks of `address` not yet confirmed by the head snapshot.
    fn get_unconfirmed_blocks(&self, address: &Address) -> Vec<AccountBlock>;
}

/// Write access to persisted chains.
///
/// An insert error means the store may be inconsistent; callers treat it
/// as fatal and never retry.
pub trait Writer: Send + Sync {
    fn insert_account_block(&self, address: &Address, block: &AccountBlock) -> Result<()>;

    /// Insert `head` and then `tail` in one transaction.
    fn insert_account_blocks(
        &self,
        address: &Address,
        head: &AccountBlock,
        tail: &[AccountBlock],
    ) -> Result<()>;

    fn insert_snapshot_block(&self, block: &SnapshotBlock) -> Result<()>;

    /// Delete every block of `target` at or above `height`.
    ///
    /// All-or-nothing. Cascades to every block that depends on a deleted
    /// one and reopens send blocks whose receive was deleted.
    fn delete_to_height(&self, target: ChainTarget, height: u64) -> Result<DeletedBlocks>;
}

/// Semantic validation against persisted state. Must not mutate.
pub trait Verifier: Send + Sync {
    fn verify_account_block(&self, block: &AccountBlock) -> Result<(), VerifyError>;

    fn verify_snapshot_block(&self, block: &SnapshotBlock) -> Result<(), VerifyError>;

    /// False when a block built against `refer` has stayed unconfirmed
    /// for too long relative to `head`.
    fn verify_account_timeout(&self, head: &HashHeight, refer: &HashHeight) -> bool;
}

/// Asks peers for missing blocks. Results re-enter through the pool's
/// ingestion calls.
pub trait Fetcher: Send + Sync {
    /// Request `count` blocks of `target` ending at `hash_height`.
    /// `hint` is the snapshot that made the block interesting, if any.
    fn fetch_by_hash_height(
        &self,
        target: ChainTarget,
        hash_height: HashHeight,
        count: u64,
        hint: Option<HashHeight>,
    );
}

/// Announces locally accepted blocks to peers.
pub trait Broadcaster: Send + Sync {
    fn broadcast_snapshot_block(&self, block: &SnapshotBlock);

    fn broadcast_account_blocks(&self, address: &Address, blocks: &[AccountBlock]);
}
