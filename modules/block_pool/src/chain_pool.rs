//! Forest of candidate chains rooted at the persisted chain.
//!
//! Blocks enter as *free* blocks, are linked into provisional *compound*
//! runs, become *snippets* once the block below their first block is
//! found in the tree, and finally join `current`, the single chain that
//! always starts at the disk head and is committed bottom-up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_common::{BlockHash, ChainReader, ChainTarget, HashHeight};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::candidate_chain::{CandidateChain, ChainId};
use crate::fork_version::ForkVersion;
use crate::pool_block::PoolBlock;
use crate::pool_error::PoolError;

/// Read-only view of the persisted chain under a chain pool.
pub trait DiskChain: Send + Sync {
    fn head(&self) -> HashHeight;

    /// Hash of the persisted block at `height`; height 0 is the zero hash.
    fn hash_at(&self, height: u64) -> Option<BlockHash>;
}

/// [`DiskChain`] over one chain of a [`ChainReader`].
pub struct LedgerDisk {
    reader: Arc<dyn ChainReader>,
    target: ChainTarget,
}

impl LedgerDisk {
    pub fn new(reader: Arc<dyn ChainReader>, target: ChainTarget) -> Self {
        Self { reader, target }
    }
}

impl DiskChain for LedgerDisk {
    fn head(&self) -> HashHeight {
        match &self.target {
            ChainTarget::Snapshot => self.reader.head_snapshot(),
            ChainTarget::Account(address) => self.reader.account_head(address),
        }
    }

    fn hash_at(&self, height: u64) -> Option<BlockHash> {
        if height == 0 {
            return Some(BlockHash::default());
        }
        match &self.target {
            ChainTarget::Snapshot => self.reader.snapshot_block_at(height).map(|b| b.hash),
            ChainTarget::Account(address) => {
                self.reader.account_block_at(address, height).map(|b| b.hash)
            }
        }
    }
}

/// Where a block was found in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLocation {
    Disk,
    Current,
    Snippet(ChainId),
}

/// Result of comparing a chain's ancestry with `current`'s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkPoint {
    /// Highest block both ancestries share
    pub key_point: HashHeight,
    /// First height at which they differ
    pub fork_height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainKind {
    Current,
    Snippet,
    Compound,
}

/// Diagnostic view of one chain
#[derive(Debug, Clone, Serialize)]
pub struct ChainDetail {
    pub id: ChainId,
    pub kind: ChainKind,
    pub tail: HashHeight,
    pub head: HashHeight,
    pub size: usize,
    pub parked: bool,
    pub failed: bool,
}

/// Diagnostic counts for one chain pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainPoolInfo {
    pub free: usize,
    pub compound: usize,
    pub snippets: usize,
    pub current_len: usize,
    pub chains: usize,
    pub disk_head: HashHeight,
    pub current_head: HashHeight,
}

pub struct ChainPool {
    name: String,
    disk: Box<dyn DiskChain>,
    version: Arc<ForkVersion>,
    fail_threshold: Duration,
    max_fork_depth: u64,
    current: CandidateChain,
    snippets: BTreeMap<ChainId, CandidateChain>,
    compound: BTreeMap<ChainId, CandidateChain>,
    free: HashMap<BlockHash, PoolBlock>,
    next_id: ChainId,
}

const CURRENT_ID: ChainId = 0;

impl ChainPool {
    pub fn new(
        name: impl Into<String>,
        disk: Box<dyn DiskChain>,
        version: Arc<ForkVersion>,
        fail_threshold: Duration,
        max_fork_depth: u64,
    ) -> Self {
        let current = CandidateChain::new(CURRENT_ID, disk.head(), &version, fail_threshold);
        Self {
            name: name.into(),
            disk,
            version,
            fail_threshold,
            max_fork_depth,
            current,
            snippets: BTreeMap::new(),
            compound: BTreeMap::new(),
            free: HashMap::new(),
            next_id: CURRENT_ID + 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disk_head(&self) -> HashHeight {
        self.disk.head()
    }

    pub fn current(&self) -> &CandidateChain {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut CandidateChain {
        &mut self.current
    }

    pub fn snippet(&self, id: ChainId) -> Option<&CandidateChain> {
        self.snippets.get(&id)
    }

    pub fn snippets(&self) -> impl Iterator<Item = &CandidateChain> {
        self.snippets.values()
    }

    fn next_chain_id(&mut self) -> ChainId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn disk_hash_at(&self, height: u64) -> Option<BlockHash> {
        if height == 0 {
            return Some(BlockHash::default());
        }
        if height > self.disk.head().height {
            return None;
        }
        self.disk.hash_at(height)
    }

    /// Buffer a block as free. False if it is already known anywhere.
    pub fn add_block(&mut self, block: PoolBlock) -> bool {
        let target = block.hash_height();
        if self.free.contains_key(&target.hash)
            || self.find_in_tree(&target).is_some()
            || self.compound.values().any(|c| c.contains(&target))
        {
            return false;
        }
        self.free.insert(target.hash, block);
        true
    }

    /// Search disk, `current` and snippets for exactly `target`.
    pub fn find_in_tree(&self, target: &HashHeight) -> Option<ChainLocation> {
        if self.current.contains(target) {
            return Some(ChainLocation::Current);
        }
        if self.disk_hash_at(target.height) == Some(target.hash) {
            return Some(ChainLocation::Disk);
        }
        self.snippets
            .iter()
            .find(|(_, chain)| chain.contains(target))
            .map(|(id, _)| ChainLocation::Snippet(*id))
    }

    /// Search the not-yet-current buffers only.
    pub fn find_in_pool(&self, target: &HashHeight) -> bool {
        self.free.get(&target.hash).is_some_and(|b| b.height() == target.height)
            || self.compound.values().any(|c| c.contains(target))
            || self.snippets.values().any(|c| c.contains(target))
    }

    /// Any pooled block with this hash
    pub fn get_block(&self, hash: &BlockHash) -> Option<&PoolBlock> {
        if let Some(block) = self.free.get(hash) {
            return Some(block);
        }
        std::iter::once(&self.current)
            .chain(self.snippets.values())
            .chain(self.compound.values())
            .flat_map(CandidateChain::blocks)
            .find(|b| b.hash() == *hash)
    }

    /// Run one compaction pass. Returns how many merges, promotions and
    /// absorbed blocks it made, zero meaning nothing moved.
    pub fn compact(&mut self) -> usize {
        self.sync_with_disk();
        self.forget_persisted();
        self.discard_stale();
        self.demote_unanchored();

        let mut advanced = self.drain_free();
        advanced += self.merge_compound();
        advanced += self.promote_anchored();
        advanced += self.merge_snippets();
        advanced
    }

    /// Re-root an empty `current` on the disk head, or detach a `current`
    /// that no longer starts there.
    pub fn sync_with_disk(&mut self) {
        let disk_head = self.disk.head();
        if self.current.tail() == disk_head {
            return;
        }
        if self.current.is_empty() {
            self.current.retarget(disk_head);
            return;
        }
        warn!(
            pool = %self.name,
            tail = %self.current.tail(),
            %disk_head,
            "Current chain detached from disk head"
        );
        let blocks = self.take_current();
        self.adopt(blocks, false);
    }

    /// Drop every buffered block the store already holds. Within a run
    /// the persisted blocks are always the lowest ones, so a run is cut
    /// from below and re-anchored on the last of them.
    pub fn forget_persisted(&mut self) -> usize {
        let disk = &self.disk;
        let disk_height = disk.head().height;
        let persisted = |block: &PoolBlock| {
            block.height() <= disk_height && disk.hash_at(block.height()) == Some(block.hash())
        };

        let before = self.free.len();
        self.free.retain(|_, block| !persisted(block));
        let mut dropped = before - self.free.len();
        for chains in [&mut self.snippets, &mut self.compound] {
            chains.retain(|_, chain| {
                while chain.first().is_some_and(|b| persisted(b)) {
                    chain.pop_first();
                    dropped += 1;
                }
                !chain.is_empty()
            });
        }
        if dropped > 0 {
            debug!(pool = %self.name, dropped, "Forgot persisted blocks");
        }
        dropped
    }

    fn take_current(&mut self) -> Vec<PoolBlock> {
        let tail = self.current.tail().height;
        let blocks = self.current.split_off_above(tail);
        self.current.retarget(self.disk.head());
        blocks
    }

    fn drain_free(&mut self) -> usize {
        if self.free.is_empty() {
            return 0;
        }
        let mut blocks: Vec<PoolBlock> = self.free.drain().map(|(_, b)| b).collect();
        blocks.sort_by_key(|b| (b.height(), b.hash()));

        let count = blocks.len();
        for block in blocks {
            let below = block.prev_hash_height();
            let own = block.hash_height();

            if let Some(chain) = self.compound.values_mut().find(|c| c.head() == below) {
                if chain.append(block).is_ok() {
                    continue;
                }
            } else if let Some(chain) = self.snippets.values_mut().find(|c| c.head() == below) {
                if chain.append(block).is_ok() {
                    continue;
                }
            } else if let Some(chain) = self.compound.values_mut().find(|c| c.tail() == own) {
                if chain.prepend(block).is_ok() {
                    continue;
                }
            } else {
                let id = self.next_chain_id();
                let mut chain = CandidateChain::new(id, below, &self.version, self.fail_threshold);
                if chain.append(block).is_ok() {
                    self.compound.insert(id, chain);
                }
            }
        }
        count
    }

    /// Join runs where exactly one run continues another
    fn merge_compound(&mut self) -> usize {
        let mut merged = 0;
        while let Some((parent, child)) = Self::unique_continuation(&self.compound, |_| true) {
            let Some(chain) = self.compound.remove(&child) else {
                break;
            };
            if let Some(parent_chain) = self.compound.get_mut(&parent) {
                if let Err(err) = parent_chain.extend(chain) {
                    warn!(pool = %self.name, %err, "Failed to join compound runs");
                }
            }
            merged += 1;
        }
        merged
    }

    /// First (parent, child) pair in `chains` where `child` is the only
    /// chain hanging off `parent`'s head
    fn unique_continuation(
        chains: &BTreeMap<ChainId, CandidateChain>,
        eligible: impl Fn(&CandidateChain) -> bool,
    ) -> Option<(ChainId, ChainId)> {
        chains.iter().filter(|(_, c)| eligible(c)).find_map(|(id, parent)| {
            let head = parent.head();
            let mut children = chains
                .iter()
                .filter(|(cid, c)| *cid != id && eligible(c) && c.tail() == head);
            match (children.next(), children.next()) {
                (Some((child, chain)), None) if chain.is_parked() == parent.is_parked() => {
                    Some((*id, *child))
                }
                _ => None,
            }
        })
    }

    /// Move runs whose anchor is now in the tree to the snippets
    fn promote_anchored(&mut self) -> usize {
        let mut promoted = 0;
        loop {
            let ready: Vec<ChainId> = self
                .compound
                .iter()
                .filter(|(_, c)| self.find_in_tree(&c.tail()).is_some())
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if let Some(chain) = self.compound.remove(&id) {
                    debug!(pool = %self.name, id, tail = %chain.tail(), head = %chain.head(), "Snippet anchored");
                    self.snippets.insert(id, chain);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Grow `current` with its unique live continuation, then join
    /// snippet pairs the same way
    fn merge_snippets(&mut self) -> usize {
        let mut merged = 0;
        loop {
            let current_head = self.current.head();
            let mut live = self
                .snippets
                .iter()
                .filter(|(_, c)| c.tail() == current_head && !c.is_parked() && !c.is_failed());
            if let (Some((id, _)), None) = (live.next(), live.next()) {
                let id = *id;
                if let Some(chain) = self.snippets.remove(&id) {
                    debug!(pool = %self.name, id, head = %chain.head(), "Snippet merged into current");
                    if let Err(err) = self.current.extend(chain) {
                        warn!(pool = %self.name, %err, "Failed to merge snippet into current");
                    }
                    merged += 1;
                    continue;
                }
            }

            if let Some((parent, child)) =
                Self::unique_continuation(&self.snippets, |c| !c.is_failed())
            {
                if let Some(chain) = self.snippets.remove(&child) {
                    if let Some(parent_chain) = self.snippets.get_mut(&parent) {
                        if let Err(err) = parent_chain.extend(chain) {
                            warn!(pool = %self.name, %err, "Failed to join snippets");
                        }
                    }
                    merged += 1;
                    continue;
                }
            }
            break;
        }
        merged
    }

    /// Drop snippets wholly below the disk head or failing persistently
    fn discard_stale(&mut self) -> usize {
        let disk_height = self.disk.head().height;
        let stale: Vec<ChainId> = self
            .snippets
            .iter_mut()
            .filter_map(|(id, c)| {
                (c.is_failed() || c.fail_stat().is_fail() || c.head().height < disk_height)
                    .then_some(*id)
            })
            .collect();
        for id in &stale {
            if let Some(chain) = self.snippets.remove(id) {
                debug!(pool = %self.name, id, head = %chain.head(), failed = chain.is_failed(), "Snippet discarded");
            }
        }
        stale.len()
    }

    /// Send snippets whose anchor vanished back to the compound buffer
    fn demote_unanchored(&mut self) {
        loop {
            let lost: Vec<ChainId> = self
                .snippets
                .iter()
                .filter(|(_, c)| self.find_in_tree(&c.tail()).is_none())
                .map(|(id, _)| *id)
                .collect();
            if lost.is_empty() {
                return;
            }
            for id in lost {
                if let Some(chain) = self.snippets.remove(&id) {
                    self.compound.insert(id, chain);
                }
            }
        }
    }

    /// Split `blocks` into linked runs and keep each as a snippet
    fn adopt(&mut self, blocks: Vec<PoolBlock>, parked: bool) -> Vec<ChainId> {
        let mut ids = Vec::new();
        let mut run: Vec<PoolBlock> = Vec::new();
        for block in blocks {
            if run.last().is_some_and(|last| block.prev_hash_height() != last.hash_height()) {
                ids.extend(self.adopt_run(std::mem::take(&mut run), parked));
            }
            run.push(block);
        }
        ids.extend(self.adopt_run(run, parked));
        ids
    }

    fn adopt_run(&mut self, run: Vec<PoolBlock>, parked: bool) -> Option<ChainId> {
        if run.is_empty() {
            return None;
        }
        let id = self.next_chain_id();
        match CandidateChain::from_blocks(id, run, &self.version, self.fail_threshold) {
            Ok(mut chain) => {
                chain.set_parked(parked);
                self.snippets.insert(id, chain);
                Some(id)
            }
            Err(err) => {
                warn!(pool = %self.name, %err, "Dropped unlinkable run");
                None
            }
        }
    }

    /// Hash at `height` along the ancestry of the chain at `location`
    fn ancestry_hash_at(&self, location: ChainLocation, height: u64) -> Option<BlockHash> {
        let mut location = location;
        loop {
            match location {
                ChainLocation::Disk => return self.disk_hash_at(height),
                ChainLocation::Current => {
                    if height > self.current.tail().height {
                        return self.current.block_at(height).map(PoolBlock::hash);
                    }
                    location = ChainLocation::Disk;
                }
                ChainLocation::Snippet(id) => {
                    let chain = self.snippets.get(&id)?;
                    let tail = chain.tail();
                    if height > tail.height {
                        return chain.block_at(height).map(PoolBlock::hash);
                    }
                    if height == tail.height {
                        return Some(tail.hash);
                    }
                    location = self.find_in_tree(&tail)?;
                }
            }
        }
    }

    fn head_of(&self, location: ChainLocation) -> Result<HashHeight, PoolError> {
        match location {
            ChainLocation::Disk => Ok(self.disk.head()),
            ChainLocation::Current => Ok(self.current.head()),
            ChainLocation::Snippet(id) => {
                self.snippets.get(&id).map(CandidateChain::head).ok_or(PoolError::ChainNotFound(id))
            }
        }
    }

    /// Walk `target`'s and `current`'s ancestries down from the lower of
    /// their heads until they agree.
    ///
    /// Gives up with [`PoolError::NeedsDeepResync`] once the walk passes
    /// `max_fork_depth` blocks below the disk head.
    pub fn get_fork_point_by_chains(&self, target: ChainLocation) -> Result<ForkPoint, PoolError> {
        let target_head = self.head_of(target)?;
        let floor = self.disk.head().height.saturating_sub(self.max_fork_depth);
        let mut height = target_head.height.min(self.current.head().height);
        loop {
            let ours = self.ancestry_hash_at(ChainLocation::Current, height);
            if let Some(hash) = ours.filter(|h| Some(*h) == self.ancestry_hash_at(target, height)) {
                return Ok(ForkPoint {
                    key_point: HashHeight::new(hash, height),
                    fork_height: height + 1,
                });
            }
            if height <= floor {
                return Err(PoolError::NeedsDeepResync {
                    target: target_head,
                    floor,
                });
            }
            height -= 1;
        }
    }

    /// Make the snippet `target` (with its ancestry) the new `current`.
    ///
    /// The fork point must not lie below the disk head; callers roll the
    /// store back first. The losing part of the old `current` is parked.
    pub fn current_modify_to_chain(
        &mut self,
        target: ChainId,
        hint: &HashHeight,
    ) -> Result<(), PoolError> {
        if !self.snippets.contains_key(&target) {
            return Err(PoolError::ChainNotFound(target));
        }
        let fork = self.get_fork_point_by_chains(ChainLocation::Snippet(target))?;
        let disk_head = self.disk.head();
        if fork.key_point.height < disk_head.height {
            return Err(PoolError::ForkBelowDisk {
                key_point: fork.key_point,
                disk_head,
            });
        }

        // Chains from the target down to where it meets current or disk,
        // each with the highest height of it that belongs to the path
        let mut path = Vec::new();
        let mut id = target;
        let mut upper = u64::MAX;
        loop {
            let chain = self.snippets.get(&id).ok_or(PoolError::ChainNotFound(id))?;
            path.push((id, upper));
            let tail = chain.tail();
            match self.find_in_tree(&tail) {
                Some(ChainLocation::Snippet(parent)) => {
                    upper = tail.height;
                    id = parent;
                }
                Some(_) => break,
                None => {
                    return Err(PoolError::NeedsDeepResync {
                        target: *hint,
                        floor: tail.height,
                    })
                }
            }
        }

        let losing = self.current.split_off_above(fork.key_point.height);
        for (id, upper) in path.iter().rev() {
            let Some(chain) = self.snippets.get_mut(id) else {
                continue;
            };
            let taken = chain.take_through(*upper);
            if chain.is_empty() {
                self.snippets.remove(id);
            }
            for block in taken {
                self.current.append(block)?;
            }
        }
        self.adopt(losing, true);

        self.version.inc();
        self.current.reset_fork_version();
        self.current.fail_stat().clear();
        info!(
            pool = %self.name,
            target,
            %hint,
            key_point = %fork.key_point,
            head = %self.current.head(),
            "Switched current chain"
        );
        Ok(())
    }

    /// Collapse `current` onto the disk head, parking its blocks.
    pub fn current_modify_to_empty(&mut self) {
        let blocks = self.take_current();
        if !blocks.is_empty() {
            info!(pool = %self.name, blocks = blocks.len(), "Current chain emptied");
        }
        self.adopt(blocks, true);
        self.version.inc();
        self.current.reset_fork_version();
    }

    /// Re-absorb blocks the store just deleted, together with everything
    /// pending in `current`, as snippets; `current` restarts at the new
    /// disk head.
    pub fn rollback_current(&mut self, deleted: Vec<PoolBlock>, park: bool) {
        let mut blocks = deleted;
        blocks.extend(self.take_current());
        if !blocks.is_empty() {
            debug!(pool = %self.name, blocks = blocks.len(), park, disk_head = %self.disk.head(), "Rolled back current");
        }
        self.adopt(blocks, park);
    }

    pub fn first_uncommitted(&self) -> Option<&PoolBlock> {
        self.current.first()
    }

    /// Drop the lowest block of `current` once the store holds it
    pub fn commit_first(&mut self) -> Option<PoolBlock> {
        let block = self.current.pop_first()?;
        self.current.fail_stat().clear();
        Some(block)
    }

    /// Give up on `current`: its blocks become a failed snippet
    pub fn demote_current_failed(&mut self) {
        let blocks = self.take_current();
        for id in self.adopt(blocks, true) {
            if let Some(chain) = self.snippets.get_mut(&id) {
                chain.mark_failed();
            }
        }
        self.version.inc();
        warn!(pool = %self.name, "Current chain failed persistently, demoted");
    }

    /// Remove what can no longer become current. Returns blocks dropped.
    pub fn prune_useless(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let disk_height = self.disk.head().height;
        let mut dropped = 0;

        let before = self.free.len();
        self.free.retain(|_, b| now.saturating_duration_since(b.received_at()) <= ttl);
        dropped += before - self.free.len();

        let idle = |c: &CandidateChain| now.saturating_duration_since(c.last_update()) > ttl;
        let stale_compound: Vec<ChainId> =
            self.compound.iter().filter(|(_, c)| idle(c)).map(|(id, _)| *id).collect();
        for id in stale_compound {
            dropped += self.compound.remove(&id).map_or(0, |c| c.size());
        }

        let stale_snippets: Vec<ChainId> = self
            .snippets
            .iter()
            .filter(|(_, c)| idle(c) || c.is_failed() || c.head().height < disk_height)
            .map(|(id, _)| *id)
            .collect();
        for id in stale_snippets {
            dropped += self.snippets.remove(&id).map_or(0, |c| c.size());
        }

        if dropped > 0 {
            debug!(pool = %self.name, dropped, "Pruned useless blocks");
        }
        dropped
    }

    /// Anchors of runs still waiting for their parent
    pub fn orphan_anchors(&self) -> Vec<HashHeight> {
        self.compound.values().map(CandidateChain::tail).collect()
    }

    /// Blocks to request so that `target` connects to the disk head
    pub fn fetch_count(&self, target: &HashHeight, default: u64) -> u64 {
        let disk_height = self.disk.head().height;
        if target.height > disk_height {
            target.height - disk_height
        } else {
            default
        }
    }

    pub fn pending_num(&self) -> usize {
        self.free.len()
            + self.current.size()
            + self.compound.values().map(CandidateChain::size).sum::<usize>()
            + self.snippets.values().map(CandidateChain::size).sum::<usize>()
    }

    pub fn info(&self) -> ChainPoolInfo {
        ChainPoolInfo {
            free: self.free.len(),
            compound: self.compound.len(),
            snippets: self.snippets.len(),
            current_len: self.current.size(),
            chains: 1 + self.compound.len() + self.snippets.len(),
            disk_head: self.disk.head(),
            current_head: self.current.head(),
        }
    }

    pub fn detail(&self) -> Vec<ChainDetail> {
        let describe = |kind, c: &CandidateChain| ChainDetail {
            id: c.id(),
            kind,
            tail: c.tail(),
            head: c.head(),
            size: c.size(),
            parked: c.is_parked(),
            failed: c.is_failed(),
        };
        std::iter::once(describe(ChainKind::Current, &self.current))
            .chain(self.snippets.values().map(|c| describe(ChainKind::Snippet, c)))
            .chain(self.compound.values().map(|c| describe(ChainKind::Compound, c)))
            .collect()
    }
}
