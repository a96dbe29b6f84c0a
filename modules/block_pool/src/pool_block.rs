//! Envelope for blocks held by a chain pool.

use std::sync::Arc;
use std::time::Instant;

use lattice_common::{AccountBlock, BlockHash, BlockSource, HashHeight, SnapshotBlock};
use serde::Serialize;

use crate::fork_version::ForkVersion;

/// Kind-specific content of a pool block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockPayload {
    Snapshot(SnapshotBlock),
    Account(AccountBlock),
}

/// A block waiting in a chain pool, with the fields every kind shares
/// lifted out of the payload.
#[derive(Debug, Clone)]
pub struct PoolBlock {
    height: u64,
    hash: BlockHash,
    prev_hash: BlockHash,
    source: BlockSource,
    /// Fork epoch the block was stamped with
    first_version: u64,
    version: Arc<ForkVersion>,
    received_at: Instant,
    payload: BlockPayload,
}

impl PoolBlock {
    pub fn snapshot(block: SnapshotBlock, version: &Arc<ForkVersion>, source: BlockSource) -> Self {
        Self {
            height: block.height,
            hash: block.hash,
            prev_hash: block.prev_hash,
            source,
            first_version: version.val(),
            version: version.clone(),
            received_at: Instant::now(),
            payload: BlockPayload::Snapshot(block),
        }
    }

    pub fn account(block: AccountBlock, version: &Arc<ForkVersion>, source: BlockSource) -> Self {
        Self {
            height: block.height,
            hash: block.hash,
            prev_hash: block.prev_hash,
            source,
            first_version: version.val(),
            version: version.clone(),
            received_at: Instant::now(),
            payload: BlockPayload::Account(block),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.prev_hash
    }

    pub fn hash_height(&self) -> HashHeight {
        HashHeight::new(self.hash, self.height)
    }

    /// The block this one builds on
    pub fn prev_hash_height(&self) -> HashHeight {
        HashHeight::new(self.prev_hash, self.height.saturating_sub(1))
    }

    pub fn source(&self) -> BlockSource {
        self.source
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn payload(&self) -> &BlockPayload {
        &self.payload
    }

    pub fn as_account(&self) -> Option<&AccountBlock> {
        match &self.payload {
            BlockPayload::Account(block) => Some(block),
            BlockPayload::Snapshot(_) => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotBlock> {
        match &self.payload {
            BlockPayload::Snapshot(block) => Some(block),
            BlockPayload::Account(_) => None,
        }
    }

    pub fn first_version(&self) -> u64 {
        self.first_version
    }

    /// True while no reorganisation happened since the block was stamped
    pub fn check_fork_version(&self) -> bool {
        self.first_version == self.version.val()
    }

    pub fn reset_fork_version(&mut self) {
        self.first_version = self.version.val();
    }
}
