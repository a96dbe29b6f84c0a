//! Verify/insert scheduling over the first uncommitted block of each pool.
//!
//! Every pass looks at one block per pool, classifies it as pending,
//! failed or insertable and acts on that. Fetch requests and fork
//! directives are collected into a [`VerifyTask`] and executed by the
//! caller once the pool locks are released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_common::{Address, ChainReader, ChainTarget, HashHeight, SnapshotBlock, VerifyError};
use tracing::{debug, warn};

use crate::chain_pool::{ChainPool, LedgerDisk};
use crate::configuration::PoolConfig;
use crate::fork_version::ForkVersion;
use crate::pool_block::PoolBlock;
use crate::pool_core::{lock, AccountEntry, PoolCore};
use crate::pool_error::PoolError;

/// Outcome of one attempt on a pool's first uncommitted block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Nothing to attempt
    Idle,
    Success,
    /// A dependency is not committed yet
    Pending,
    Fail,
}

/// Request for blocks some pool is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub target: ChainTarget,
    pub hash_height: HashHeight,
    pub count: u64,
    pub hint: Option<HashHeight>,
}

/// A snapshot confirmation an account chain has to be forked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountFork {
    pub address: Address,
    pub hash_height: HashHeight,
    pub snapshot: HashHeight,
}

#[derive(Debug)]
pub struct VerifyTask {
    pub outcome: VerifyOutcome,
    pub requests: Vec<FetchRequest>,
    pub forks: Vec<AccountFork>,
}

impl VerifyTask {
    fn new(outcome: VerifyOutcome, requests: Vec<FetchRequest>) -> Self {
        Self {
            outcome,
            requests,
            forks: Vec::new(),
        }
    }
}

/// Remembers issued fetches so a missing block is requested once per
/// retry window
pub(crate) struct FetchTracker {
    retry: Duration,
    issued: HashMap<HashHeight, Instant>,
}

impl FetchTracker {
    pub(crate) fn new(retry: Duration) -> Self {
        Self {
            retry,
            issued: HashMap::new(),
        }
    }

    pub(crate) fn should_fetch(&mut self, target: HashHeight) -> bool {
        let now = Instant::now();
        match self.issued.get(&target) {
            Some(at) if now.saturating_duration_since(*at) < self.retry => false,
            _ => {
                self.issued.insert(target, now);
                true
            }
        }
    }

    pub(crate) fn prune(&mut self) {
        let now = Instant::now();
        let retry = self.retry;
        self.issued.retain(|_, at| now.saturating_duration_since(*at) < retry);
    }
}

/// A chain pool together with its fetch bookkeeping
pub(crate) struct PoolSlot {
    pub(crate) chains: ChainPool,
    pub(crate) fetches: FetchTracker,
}

impl PoolSlot {
    pub(crate) fn new(
        target: ChainTarget,
        reader: Arc<dyn ChainReader>,
        version: Arc<ForkVersion>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            chains: ChainPool::new(
                target.to_string(),
                Box::new(LedgerDisk::new(reader, target)),
                version,
                config.fail_threshold(),
                config.max_fork_depth,
            ),
            fetches: FetchTracker::new(config.fetch_retry()),
        }
    }

    /// Queue a fetch for `target` unless it is already pooled or was
    /// requested recently
    pub(crate) fn request(
        &mut self,
        chain: ChainTarget,
        target: HashHeight,
        default_count: u64,
        hint: Option<HashHeight>,
        requests: &mut Vec<FetchRequest>,
    ) {
        if target.height == 0
            || self.chains.find_in_tree(&target).is_some()
            || self.chains.find_in_pool(&target)
            || !self.fetches.should_fetch(target)
        {
            return;
        }
        requests.push(FetchRequest {
            target: chain,
            hash_height: target,
            count: self.chains.fetch_count(&target, default_count),
            hint,
        });
    }

    /// Fetches for the anchors of every orphaned run
    fn orphan_requests(&mut self, chain: ChainTarget, default_count: u64) -> Vec<FetchRequest> {
        let mut requests = Vec::new();
        for anchor in self.chains.orphan_anchors() {
            self.request(chain, anchor, default_count, None, &mut requests);
        }
        requests
    }

    /// First uncommitted block, restamped and reported as stale if a
    /// reorganisation happened since it was queued
    fn first_fresh(&mut self) -> Result<Option<PoolBlock>, PoolError> {
        self.chains.sync_with_disk();
        let Some(first) = self.chains.first_uncommitted() else {
            return Ok(None);
        };
        if !first.check_fork_version() {
            let stamped = first.first_version();
            self.chains.current_mut().reset_fork_version();
            return Err(PoolError::StaleForkVersion {
                stamped,
                current: self.chains.current().blocks().next().map_or(0, PoolBlock::first_version),
            });
        }
        Ok(Some(first.clone()))
    }

    fn still_first(&self, block: &PoolBlock) -> bool {
        self.chains
            .first_uncommitted()
            .is_some_and(|b| b.hash() == block.hash() && b.check_fork_version())
    }

    /// Count a failed attempt on `current`, giving it up once the
    /// failure persists
    fn record_failure(&mut self) {
        let stat = self.chains.current_mut().fail_stat();
        stat.inc();
        if stat.is_fail() {
            self.chains.demote_current_failed();
        }
    }
}

/// Clears the busy flag of an account pool when the attempt ends
struct Claim<'a>(&'a AccountEntry);

impl<'a> Claim<'a> {
    fn acquire(entry: &'a AccountEntry) -> Option<Self> {
        entry.try_claim().then_some(Self(entry))
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl PoolCore {
    /// One attempt on the snapshot pool. True if a block was committed.
    pub(crate) fn snapshot_pass(&self) -> Result<bool, PoolError> {
        let task = {
            let _shared = self.read_lock();
            self.verify_snapshot_head()?
        };
        self.dispatch(task.requests);

        for fork in task.forks {
            let target = ChainTarget::Account(fork.address);
            if let Err(err) = self.fork_to(target, fork.hash_height, Some(fork.snapshot)) {
                warn!(%target, to = %fork.hash_height, snapshot = %fork.snapshot, %err, "Account fork failed");
            }
        }
        Ok(task.outcome == VerifyOutcome::Success)
    }

    /// One attempt on every account pool not busy under another worker.
    /// Returns the number of committed blocks.
    pub(crate) fn account_pass(&self) -> Result<usize, PoolError> {
        let mut committed = 0;
        for (address, entry) in self.account_entries() {
            let Some(_claim) = Claim::acquire(&entry) else {
                continue;
            };
            let task = {
                let _shared = self.read_lock();
                self.verify_account_head(address, &entry)?
            };
            self.dispatch(task.requests);
            if task.outcome == VerifyOutcome::Success {
                committed += 1;
            }
        }
        Ok(committed)
    }

    fn verify_snapshot_head(&self) -> Result<VerifyTask, PoolError> {
        let default_count = self.config.default_fetch_count;
        let mut slot = lock(&self.snapshot);
        let mut requests = slot.orphan_requests(ChainTarget::Snapshot, default_count);

        let pooled = match slot.first_fresh() {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(VerifyTask::new(VerifyOutcome::Idle, requests)),
            Err(err) => {
                debug!(%err, "Snapshot head restamped");
                return Ok(VerifyTask::new(VerifyOutcome::Fail, requests));
            }
        };
        let Some(block) = pooled.as_snapshot() else {
            return Ok(VerifyTask::new(VerifyOutcome::Fail, requests));
        };

        // Confirmations may only move persisted state forward, so they are
        // checked before any of them can roll an account chain back
        if let Err(err) = self.check_confirmations(block) {
            warn!(snapshot = %block.hash_height(), %err, "Snapshot block contradicts persisted state");
            slot.record_failure();
            return Ok(VerifyTask::new(VerifyOutcome::Fail, requests));
        }

        let mut forks = Vec::new();
        let mut pending = false;
        for (address, confirmed) in &block.content {
            let persisted = self.reader.account_block_at(address, confirmed.height).map(|b| b.hash);
            if persisted == Some(confirmed.hash) {
                continue;
            }
            pending = true;
            if persisted.is_some() {
                forks.push(AccountFork {
                    address: *address,
                    hash_height: *confirmed,
                    snapshot: block.hash_height(),
                });
                continue;
            }

            let entry = self.account_entry(address);
            let mut account = lock(&entry.slot);
            let target = ChainTarget::Account(*address);
            match self.pending_to(
                &mut account,
                target,
                confirmed,
                Some(block.hash_height()),
                &mut requests,
            ) {
                Ok(None) => {}
                Ok(Some(unresolved)) => forks.push(AccountFork {
                    address: *address,
                    hash_height: unresolved,
                    snapshot: block.hash_height(),
                }),
                Err(err) => {
                    warn!(%target, confirmed = %confirmed, snapshot = %block.hash_height(), %err, "Cannot reconcile confirmed account head");
                }
            }
        }
        if pending {
            return Ok(VerifyTask {
                outcome: VerifyOutcome::Pending,
                requests,
                forks,
            });
        }

        match self.verifier.verify_snapshot_block(block) {
            Ok(()) => {
                self.writer.insert_snapshot_block(block).map_err(|err| self.halt(err))?;
                slot.chains.commit_first();
                debug!(snapshot = %block.hash_height(), accounts = block.content.len(), "Committed snapshot block");
                Ok(VerifyTask::new(VerifyOutcome::Success, requests))
            }
            Err(err) => {
                warn!(snapshot = %block.hash_height(), %err, "Snapshot block failed verification");
                slot.record_failure();
                Ok(VerifyTask::new(VerifyOutcome::Fail, requests))
            }
        }
    }

    /// Reject a snapshot that is corrupt, does not extend the persisted
    /// head, or names a different block at or below an account's
    /// confirmed height
    fn check_confirmations(&self, block: &SnapshotBlock) -> Result<(), VerifyError> {
        let computed = block.compute_hash();
        if computed != block.hash {
            return Err(VerifyError::HashMismatch {
                sealed: block.hash,
                computed,
            });
        }
        let head = self.reader.head_snapshot();
        if block.height != head.height + 1 || block.prev_hash != head.hash {
            return Err(VerifyError::NotExtendingHead {
                block: block.hash_height(),
                head,
            });
        }

        for (address, proposed) in &block.content {
            let confirmed = match self.reader.get_first_unconfirmed_block(address, &head) {
                Some(first) => first.height - 1,
                None => self.reader.account_head(address).height,
            };
            if proposed.height < confirmed {
                return Err(VerifyError::ContentRegression {
                    address: *address,
                    confirmed,
                    proposed: proposed.height,
                });
            }
            if proposed.height == confirmed && !self.is_account_block_persisted(address, proposed) {
                return Err(VerifyError::ContentConflict {
                    address: *address,
                    confirmed,
                    proposed: *proposed,
                });
            }
        }
        Ok(())
    }

    fn verify_account_head(
        &self,
        address: Address,
        entry: &AccountEntry,
    ) -> Result<VerifyTask, PoolError> {
        let default_count = self.config.default_fetch_count;
        let target = ChainTarget::Account(address);
        if self.is_block_listed(&address) {
            return Ok(VerifyTask::new(VerifyOutcome::Idle, Vec::new()));
        }

        let (pooled, mut requests) = {
            let mut slot = lock(&entry.slot);
            let requests = slot.orphan_requests(target, default_count);
            match slot.first_fresh() {
                Ok(Some(block)) => (block, requests),
                Ok(None) => return Ok(VerifyTask::new(VerifyOutcome::Idle, requests)),
                Err(err) => {
                    debug!(%target, %err, "Account head restamped");
                    return Ok(VerifyTask::new(VerifyOutcome::Fail, requests));
                }
            }
        };
        let Some(block) = pooled.as_account() else {
            return Ok(VerifyTask::new(VerifyOutcome::Fail, requests));
        };

        // Dependencies are checked without holding this pool's lock so
        // that the sender's pool can be consulted
        if !block.snapshot_hash.is_zero()
            && self.reader.get_snapshot_block_by_hash(&block.snapshot_hash).is_none()
        {
            return Ok(VerifyTask::new(VerifyOutcome::Pending, requests));
        }
        if let Some((from, send)) = block.received_send() {
            if !self.is_account_block_persisted(&from, &send) {
                let sender = self.account_entry(&from);
                lock(&sender.slot).request(
                    ChainTarget::Account(from),
                    send,
                    default_count,
                    Some(block.hash_height()),
                    &mut requests,
                );
                return Ok(VerifyTask::new(VerifyOutcome::Pending, requests));
            }
        }

        let mut slot = lock(&entry.slot);
        if !slot.still_first(&pooled) {
            return Ok(VerifyTask::new(VerifyOutcome::Idle, requests));
        }
        match self.verifier.verify_account_block(block) {
            Ok(()) => {
                self.writer.insert_account_block(&address, block).map_err(|err| self.halt(err))?;
                slot.chains.commit_first();
                debug!(%address, block = %block.hash_height(), "Committed account block");
                Ok(VerifyTask::new(VerifyOutcome::Success, requests))
            }
            Err(err) => {
                warn!(%address, block = %block.hash_height(), %err, "Account block failed verification");
                slot.record_failure();
                self.block_list.insert(address, Instant::now() + self.config.block_list());
                requests.clear();
                Ok(VerifyTask::new(VerifyOutcome::Fail, requests))
            }
        }
    }

    /// Hand requests to the fetcher; never called under a pool lock
    pub(crate) fn dispatch(&self, requests: Vec<FetchRequest>) {
        for request in requests {
            debug!(target = %request.target, block = %request.hash_height, count = request.count, "Fetching");
            self.fetcher.fetch_by_hash_height(
                request.target,
                request.hash_height,
                request.count,
                request.hint,
            );
        }
    }

    pub(crate) fn account_entries(&self) -> Vec<(Address, Arc<AccountEntry>)> {
        self.accounts.iter().map(|entry| (*entry.key(), entry.value().clone())).collect()
    }
}
