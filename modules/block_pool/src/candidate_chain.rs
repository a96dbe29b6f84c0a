//! Contiguous run of pool blocks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_common::HashHeight;

use crate::fail_stat::FailStat;
use crate::fork_version::ForkVersion;
use crate::pool_block::PoolBlock;
use crate::pool_error::PoolError;

pub type ChainId = u64;

/// An ordered, singly linked run of blocks above `tail`.
///
/// `tail` is the block immediately below the first own block and lives in
/// whatever chain this one hangs off. `head` is the last own block, or
/// `tail` itself when the chain is empty.
#[derive(Debug)]
pub struct CandidateChain {
    id: ChainId,
    tail: HashHeight,
    blocks: VecDeque<PoolBlock>,
    fail_stat: FailStat,
    version: Arc<ForkVersion>,
    first_version: u64,
    last_update: Instant,
    /// Lost a fork; only an explicit switch brings it back
    parked: bool,
    /// Failed verification for too long; dropped by the next compaction
    failed: bool,
}

impl CandidateChain {
    pub fn new(
        id: ChainId,
        tail: HashHeight,
        version: &Arc<ForkVersion>,
        fail_threshold: Duration,
    ) -> Self {
        Self {
            id,
            tail,
            blocks: VecDeque::new(),
            fail_stat: FailStat::new(fail_threshold),
            version: version.clone(),
            first_version: version.val(),
            last_update: Instant::now(),
            parked: false,
            failed: false,
        }
    }

    /// Build a chain from blocks ascending by height, anchored below the first one
    pub fn from_blocks(
        id: ChainId,
        blocks: Vec<PoolBlock>,
        version: &Arc<ForkVersion>,
        fail_threshold: Duration,
    ) -> Result<Self, PoolError> {
        let tail = blocks.first().map(PoolBlock::prev_hash_height).unwrap_or_default();
        let mut chain = Self::new(id, tail, version, fail_threshold);
        for block in blocks {
            chain.append(block)?;
        }
        Ok(chain)
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn tail(&self) -> HashHeight {
        self.tail
    }

    pub fn head(&self) -> HashHeight {
        self.blocks.back().map(PoolBlock::hash_height).unwrap_or(self.tail)
    }

    pub fn block_at(&self, height: u64) -> Option<&PoolBlock> {
        if height <= self.tail.height {
            return None;
        }
        self.blocks.get((height - self.tail.height - 1) as usize)
    }

    /// True if one of this chain's own blocks is `target`
    pub fn contains(&self, target: &HashHeight) -> bool {
        self.block_at(target.height).is_some_and(|b| b.hash() == target.hash)
    }

    pub fn first(&self) -> Option<&PoolBlock> {
        self.blocks.front()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &PoolBlock> {
        self.blocks.iter()
    }

    /// Add `block` on top. Fails unless it links to the current head.
    pub fn append(&mut self, block: PoolBlock) -> Result<(), PoolError> {
        let head = self.head();
        if block.prev_hash_height() != head {
            return Err(PoolError::LinkMismatch {
                expected: head,
                got: block.hash_height(),
            });
        }
        self.blocks.push_back(block);
        self.touch();
        Ok(())
    }

    /// Add `block` underneath. Fails unless it is the block at `tail`.
    pub fn prepend(&mut self, block: PoolBlock) -> Result<(), PoolError> {
        if block.hash_height() != self.tail {
            return Err(PoolError::LinkMismatch {
                expected: self.tail,
                got: block.hash_height(),
            });
        }
        self.tail = block.prev_hash_height();
        self.blocks.push_front(block);
        self.touch();
        Ok(())
    }

    /// Append every block of `other`, which must hang off this chain's head
    pub fn extend(&mut self, other: CandidateChain) -> Result<(), PoolError> {
        if other.tail != self.head() {
            return Err(PoolError::LinkMismatch {
                expected: self.head(),
                got: other.tail,
            });
        }
        self.blocks.extend(other.blocks);
        self.touch();
        Ok(())
    }

    /// Remove the lowest block, advancing `tail` onto it
    pub fn pop_first(&mut self) -> Option<PoolBlock> {
        let block = self.blocks.pop_front()?;
        self.tail = block.hash_height();
        self.touch();
        Some(block)
    }

    /// Remove every block at or below `height` from the bottom
    pub fn take_through(&mut self, height: u64) -> Vec<PoolBlock> {
        let mut taken = Vec::new();
        while self.first().is_some_and(|b| b.height() <= height) {
            if let Some(block) = self.pop_first() {
                taken.push(block);
            }
        }
        taken
    }

    /// Remove and return every block above `height`; `tail` stays put
    pub fn split_off_above(&mut self, height: u64) -> Vec<PoolBlock> {
        let keep = height.saturating_sub(self.tail.height) as usize;
        if keep >= self.blocks.len() {
            return Vec::new();
        }
        let above = self.blocks.split_off(keep);
        self.touch();
        above.into_iter().collect()
    }

    /// Move the anchor of an empty chain
    pub fn retarget(&mut self, tail: HashHeight) {
        debug_assert!(self.blocks.is_empty());
        self.tail = tail;
    }

    pub fn check_fork_version(&self) -> bool {
        self.first_version == self.version.val()
    }

    /// Restamp the chain and every block in it with the current epoch
    pub fn reset_fork_version(&mut self) {
        self.first_version = self.version.val();
        for block in self.blocks.iter_mut() {
            block.reset_fork_version();
        }
    }

    pub fn fail_stat(&mut self) -> &mut FailStat {
        &mut self.fail_stat
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn set_parked(&mut self, parked: bool) {
        self.parked = parked;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}
