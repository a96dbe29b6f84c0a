//! State shared between the [`BlockPool`](crate::BlockPool) facade and its loops.
//!
//! Lock order is the exclusive/shared pool lock, then the snapshot slot,
//! then at most one account slot. No guard is held across an `.await`.
//!
//! The locks are `std::sync` ones taken from inside tokio tasks. While a
//! producer holds the exclusive lock the loops block their worker thread
//! until it is released; critical sections never await, so this only
//! stalls and never deadlocks the runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use lattice_common::{
    AccountBlock, Address, BlockHash, BlockSource, Broadcaster, ChainReader, ChainTarget, Fetcher,
    HashHeight, SnapshotBlock, Verifier, VerifyError, Writer,
};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::chain_pool::{ChainDetail, ChainPoolInfo};
use crate::configuration::PoolConfig;
use crate::fork_version::ForkVersion;
use crate::pool_block::{BlockPayload, PoolBlock};
use crate::pool_error::PoolError;
use crate::scheduler::PoolSlot;

/// External capabilities the pool is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub reader: Arc<dyn ChainReader>,
    pub writer: Arc<dyn Writer>,
    pub verifier: Arc<dyn Verifier>,
    pub fetcher: Arc<dyn Fetcher>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Pool state stays consistent between statements, so a poisoned lock is
/// still usable
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One account's pool, created on first use and kept for the process lifetime
pub(crate) struct AccountEntry {
    pub(crate) slot: Mutex<PoolSlot>,
    busy: AtomicBool,
}

impl AccountEntry {
    pub(crate) fn new(slot: PoolSlot) -> Self {
        Self {
            slot: Mutex::new(slot),
            busy: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Diagnostic summary of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub fork_version: u64,
    pub halted: bool,
    pub block_listed: usize,
    pub snapshot: ChainPoolInfo,
    pub accounts: BTreeMap<Address, ChainPoolInfo>,
}

/// A block found in one of the pools
#[derive(Debug, Clone, Serialize)]
pub struct PooledBlockInfo {
    pub block: BlockPayload,
    pub source: BlockSource,
    pub fork_version: u64,
    pub queued_ms: u128,
}

impl PooledBlockInfo {
    fn from_block(block: &PoolBlock) -> Self {
        Self {
            block: block.payload().clone(),
            source: block.source(),
            fork_version: block.first_version(),
            queued_ms: block.received_at().elapsed().as_millis(),
        }
    }
}

pub(crate) struct PoolCore {
    pub(crate) config: PoolConfig,
    pub(crate) version: Arc<ForkVersion>,
    pub(crate) reader: Arc<dyn ChainReader>,
    pub(crate) writer: Arc<dyn Writer>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) broadcaster: Arc<dyn Broadcaster>,
    exclusive: RwLock<()>,
    pub(crate) snapshot: Mutex<PoolSlot>,
    pub(crate) accounts: DashMap<Address, Arc<AccountEntry>>,
    /// Addresses skipped by the insert loops until the given instant
    pub(crate) block_list: DashMap<Address, Instant>,
    /// Addresses that submitted blocks through this node
    local_addresses: DashSet<Address>,
    pub(crate) new_blocks: Notify,
    halted: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl PoolCore {
    pub(crate) fn new(config: PoolConfig, collaborators: Collaborators) -> Self {
        let version = Arc::new(ForkVersion::new());
        let snapshot = PoolSlot::new(
            ChainTarget::Snapshot,
            collaborators.reader.clone(),
            version.clone(),
            &config,
        );
        Self {
            config,
            version,
            reader: collaborators.reader,
            writer: collaborators.writer,
            verifier: collaborators.verifier,
            fetcher: collaborators.fetcher,
            broadcaster: collaborators.broadcaster,
            exclusive: RwLock::new(()),
            snapshot: Mutex::new(snapshot),
            accounts: DashMap::new(),
            block_list: DashMap::new(),
            local_addresses: DashSet::new(),
            new_blocks: Notify::new(),
            halted: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.exclusive.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.exclusive.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn new_slot(&self, target: ChainTarget) -> PoolSlot {
        PoolSlot::new(target, self.reader.clone(), self.version.clone(), &self.config)
    }

    /// Load-or-insert the pool of `address`
    pub(crate) fn account_entry(&self, address: &Address) -> Arc<AccountEntry> {
        if let Some(entry) = self.accounts.get(address) {
            return entry.value().clone();
        }
        self.accounts
            .entry(*address)
            .or_insert_with(|| {
                debug!(%address, "Created account pool");
                Arc::new(AccountEntry::new(self.new_slot(ChainTarget::Account(*address))))
            })
            .value()
            .clone()
    }

    pub(crate) fn with_slot<R>(&self, target: ChainTarget, f: impl FnOnce(&mut PoolSlot) -> R) -> R {
        match target {
            ChainTarget::Snapshot => f(&mut lock(&self.snapshot)),
            ChainTarget::Account(address) => {
                let entry = self.account_entry(&address);
                let mut slot = lock(&entry.slot);
                f(&mut slot)
            }
        }
    }

    pub(crate) fn is_block_listed(&self, address: &Address) -> bool {
        let until = self.block_list.get(address).map(|entry| *entry.value());
        match until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                self.block_list.remove(address);
                false
            }
            None => false,
        }
    }

    pub(crate) fn is_account_block_persisted(&self, address: &Address, target: &HashHeight) -> bool {
        self.reader.account_block_at(address, target.height).is_some_and(|b| b.hash == target.hash)
    }

    /// Record a storage write failure; every loop stops on its next wake-up
    pub(crate) fn halt(&self, err: anyhow::Error) -> PoolError {
        let err = PoolError::storage(err);
        error!(%err, "Storage write failed, halting block pool");
        lock(&self.fatal).get_or_insert_with(|| err.to_string());
        self.halted.store(true, Ordering::SeqCst);
        self.new_blocks.notify_waiters();
        err
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn fatal_error(&self) -> Option<String> {
        lock(&self.fatal).clone()
    }

    fn check_running(&self) -> Result<(), PoolError> {
        match self.fatal_error() {
            Some(message) => Err(PoolError::Halted(message)),
            None => Ok(()),
        }
    }

    fn check_hash_account(block: &AccountBlock) -> Result<(), PoolError> {
        let computed = block.compute_hash();
        if computed != block.hash {
            return Err(VerifyError::HashMismatch {
                sealed: block.hash,
                computed,
            }
            .into());
        }
        Ok(())
    }

    // Network ingestion

    pub(crate) fn add_snapshot_block(&self, block: SnapshotBlock, source: BlockSource) -> bool {
        if block.height == 0 {
            return false;
        }
        if !block.verify_hash() {
            warn!(snapshot = %block.hash_height(), ?source, "Dropped snapshot block with bad hash");
            return false;
        }
        if self.reader.snapshot_block_at(block.height).is_some_and(|b| b.hash == block.hash) {
            return false;
        }
        let pooled = PoolBlock::snapshot(block, &self.version, source);
        let added = lock(&self.snapshot).chains.add_block(pooled);
        if added {
            self.new_blocks.notify_waiters();
        }
        added
    }

    pub(crate) fn add_account_block(
        &self,
        address: Address,
        block: AccountBlock,
        source: BlockSource,
    ) -> bool {
        if block.height == 0 {
            return false;
        }
        if block.address != address {
            warn!(%address, owner = %block.address, block = %block.hash_height(), "Dropped account block for another address");
            return false;
        }
        if !block.verify_hash() {
            warn!(%address, block = %block.hash_height(), ?source, "Dropped account block with bad hash");
            return false;
        }
        if self.is_account_block_persisted(&address, &block.hash_height()) {
            return false;
        }
        let pooled = PoolBlock::account(block, &self.version, source);
        let added = lock(&self.account_entry(&address).slot).chains.add_block(pooled);
        if added {
            self.new_blocks.notify_waiters();
        }
        added
    }

    // Local submission

    /// Insert a locally created account block straight into the store.
    ///
    /// A block whose send or snapshot is not committed yet is accepted and
    /// queued in `current`; it is inserted by the scheduler later.
    pub(crate) fn insert_direct_account_block(
        &self,
        address: Address,
        block: AccountBlock,
    ) -> Result<(), PoolError> {
        self.check_running()?;
        if block.address != address {
            return Err(PoolError::AddressMismatch {
                expected: address,
                got: block.address,
            });
        }
        Self::check_hash_account(&block)?;

        let mut requests = Vec::new();
        {
            let _shared = self.read_lock();
            let entry = self.account_entry(&address);
            let mut slot = lock(&entry.slot);
            slot.chains.sync_with_disk();
            let pending = slot.chains.current().size();
            if pending > 0 {
                return Err(PoolError::PendingNotEmpty {
                    target: ChainTarget::Account(address),
                    pending,
                });
            }
            let head = slot.chains.disk_head();
            if block.height != head.height + 1 || block.prev_hash != head.hash {
                return Err(PoolError::LinkMismatch {
                    expected: head,
                    got: block.hash_height(),
                });
            }

            let missing_send = block
                .received_send()
                .filter(|(from, send)| !self.is_account_block_persisted(from, send));
            let missing_snapshot = !block.snapshot_hash.is_zero()
                && self.reader.get_snapshot_block_by_hash(&block.snapshot_hash).is_none();
            if missing_send.is_some() || missing_snapshot {
                debug!(%address, block = %block.hash_height(), "Local block waits for dependencies");
                let own = block.hash_height();
                slot.chains
                    .current_mut()
                    .append(PoolBlock::account(block, &self.version, BlockSource::Local))?;
                drop(slot);
                if let Some((from, send)) = missing_send {
                    let sender = self.account_entry(&from);
                    lock(&sender.slot).request(
                        ChainTarget::Account(from),
                        send,
                        self.config.default_fetch_count,
                        Some(own),
                        &mut requests,
                    );
                }
            } else {
                self.verifier.verify_account_block(&block)?;
                self.writer.insert_account_block(&address, &block).map_err(|err| self.halt(err))?;
                slot.chains.sync_with_disk();
                slot.chains.forget_persisted();
                drop(slot);
                info!(%address, block = %block.hash_height(), "Inserted local account block");
                self.broadcaster.broadcast_account_blocks(&address, std::slice::from_ref(&block));
            }
        }
        self.local_addresses.insert(address);
        self.dispatch(requests);
        self.new_blocks.notify_waiters();
        Ok(())
    }

    /// Insert a received block followed by the sends it produced, as one write
    pub(crate) fn insert_direct_account_blocks(
        &self,
        address: Address,
        received: AccountBlock,
        sends: Vec<AccountBlock>,
    ) -> Result<(), PoolError> {
        self.check_running()?;
        let mut previous = received.hash_height();
        for block in std::iter::once(&received).chain(&sends) {
            if block.address != address {
                return Err(PoolError::AddressMismatch {
                    expected: address,
                    got: block.address,
                });
            }
            Self::check_hash_account(block)?;
        }
        for send in &sends {
            if !send.is_send() {
                return Err(VerifyError::Rejected(format!("{} is not a send", send.hash_height())).into());
            }
            if send.height != previous.height + 1 || send.prev_hash != previous.hash {
                return Err(PoolError::LinkMismatch {
                    expected: previous,
                    got: send.hash_height(),
                });
            }
            previous = send.hash_height();
        }

        {
            let _shared = self.read_lock();
            let entry = self.account_entry(&address);
            let mut slot = lock(&entry.slot);
            slot.chains.sync_with_disk();
            let pending = slot.chains.current().size();
            if pending > 0 {
                return Err(PoolError::PendingNotEmpty {
                    target: ChainTarget::Account(address),
                    pending,
                });
            }
            self.verifier.verify_account_block(&received)?;
            self.writer
                .insert_account_blocks(&address, &received, &sends)
                .map_err(|err| self.halt(err))?;
            slot.chains.sync_with_disk();
            slot.chains.forget_persisted();
        }
        info!(%address, head = %previous, count = 1 + sends.len(), "Inserted local account blocks");

        let mut blocks = Vec::with_capacity(1 + sends.len());
        blocks.push(received);
        blocks.extend(sends);
        self.broadcaster.broadcast_account_blocks(&address, &blocks);
        self.local_addresses.insert(address);
        self.new_blocks.notify_waiters();
        Ok(())
    }

    /// Insert a locally produced snapshot block. The caller holds the
    /// exclusive lock.
    pub(crate) fn insert_direct_snapshot_block(&self, block: SnapshotBlock) -> Result<(), PoolError> {
        self.check_running()?;
        let computed = block.compute_hash();
        if computed != block.hash {
            return Err(VerifyError::HashMismatch {
                sealed: block.hash,
                computed,
            }
            .into());
        }
        {
            let mut slot = lock(&self.snapshot);
            slot.chains.sync_with_disk();
            let pending = slot.chains.current().size();
            if pending > 0 {
                return Err(PoolError::PendingNotEmpty {
                    target: ChainTarget::Snapshot,
                    pending,
                });
            }
            self.verifier.verify_snapshot_block(&block)?;
            self.writer.insert_snapshot_block(&block).map_err(|err| self.halt(err))?;
            slot.chains.sync_with_disk();
            slot.chains.forget_persisted();
        }
        info!(snapshot = %block.hash_height(), accounts = block.content.len(), "Inserted local snapshot block");
        self.broadcaster.broadcast_snapshot_block(&block);
        self.new_blocks.notify_waiters();
        Ok(())
    }

    /// True if `address` has a queued receive of `send_hash`
    pub(crate) fn exist_in_pool(&self, address: &Address, send_hash: &BlockHash) -> bool {
        let Some(entry) = self.accounts.get(address).map(|e| e.value().clone()) else {
            return false;
        };
        let slot = lock(&entry.slot);
        let queued = slot
            .chains
            .current()
            .blocks()
            .filter_map(PoolBlock::as_account)
            .any(|b| b.received_send().is_some_and(|(_, send)| send.hash == *send_hash));
        queued
    }

    // Maintenance

    /// Compact every pool. Returns the total progress made.
    pub(crate) fn compact_pass(&self) -> usize {
        let _shared = self.read_lock();
        let mut advanced = lock(&self.snapshot).chains.compact();
        for (_, entry) in self.account_entries() {
            advanced += lock(&entry.slot).chains.compact();
        }
        if advanced > 0 {
            self.new_blocks.notify_waiters();
        }
        advanced
    }

    /// Roll back accounts whose oldest unconfirmed block has waited too
    /// many snapshots. Returns the number of accounts rolled back.
    pub(crate) fn evict_timed_out(&self) -> Result<usize, PoolError> {
        let head = self.reader.head_snapshot();
        let mut evicted = 0;
        for (address, _) in self.account_entries() {
            let Some(first) = self.reader.get_first_unconfirmed_block(&address, &head) else {
                continue;
            };
            let refer = if first.snapshot_hash.is_zero() {
                HashHeight::genesis()
            } else {
                match self.reader.get_snapshot_block_by_hash(&first.snapshot_hash) {
                    Some(snapshot) => snapshot.hash_height(),
                    None => continue,
                }
            };
            if self.verifier.verify_account_timeout(&head, &refer) {
                continue;
            }

            warn!(%address, block = %first.hash_height(), %head, %refer, "Evicting unconfirmed account blocks");
            let _exclusive = self.write_lock();
            self.rollback_to_locked(ChainTarget::Account(address), first.height - 1, true)?;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Drop stale chains, fetch records and expired block-list entries
    pub(crate) fn prune(&self) -> usize {
        let ttl = self.config.snippet_ttl();
        let _shared = self.read_lock();
        let prune_slot = |slot: &mut PoolSlot| {
            slot.fetches.prune();
            slot.chains.prune_useless(ttl)
        };
        let mut dropped = prune_slot(&mut lock(&self.snapshot));
        for (_, entry) in self.account_entries() {
            dropped += prune_slot(&mut lock(&entry.slot));
        }
        let now = Instant::now();
        self.block_list.retain(|_, until| *until > now);
        dropped
    }

    /// Re-send committed but unconfirmed blocks of local addresses
    pub(crate) fn rebroadcast(&self) -> usize {
        let addresses: Vec<Address> = self.local_addresses.iter().map(|a| *a.key()).collect();
        let mut sent = 0;
        for address in addresses {
            let blocks = self.reader.get_unconfirmed_blocks(&address);
            if blocks.is_empty() {
                continue;
            }
            self.broadcaster.broadcast_account_blocks(&address, &blocks);
            sent += blocks.len();
        }
        if sent > 0 {
            debug!(sent, "Rebroadcast unconfirmed local blocks");
        }
        sent
    }

    // Diagnostics

    pub(crate) fn info(&self) -> PoolInfo {
        PoolInfo {
            fork_version: self.version.val(),
            halted: self.is_halted(),
            block_listed: self.block_list.len(),
            snapshot: lock(&self.snapshot).chains.info(),
            accounts: self
                .account_entries()
                .into_iter()
                .map(|(address, entry)| (address, lock(&entry.slot).chains.info()))
                .collect(),
        }
    }

    pub(crate) fn snapshot_chain_detail(&self) -> Vec<ChainDetail> {
        lock(&self.snapshot).chains.detail()
    }

    pub(crate) fn account_chain_detail(&self, address: &Address) -> Vec<ChainDetail> {
        self.accounts
            .get(address)
            .map(|e| e.value().clone())
            .map(|entry| lock(&entry.slot).chains.detail())
            .unwrap_or_default()
    }

    pub(crate) fn snapshot_pending_num(&self) -> usize {
        lock(&self.snapshot).chains.pending_num()
    }

    pub(crate) fn account_pending_num(&self, address: &Address) -> usize {
        self.accounts
            .get(address)
            .map(|e| e.value().clone())
            .map_or(0, |entry| lock(&entry.slot).chains.pending_num())
    }

    pub(crate) fn snapshot_block_info(&self, hash: &BlockHash) -> Option<PooledBlockInfo> {
        lock(&self.snapshot).chains.get_block(hash).map(PooledBlockInfo::from_block)
    }

    pub(crate) fn account_block_info(
        &self,
        address: &Address,
        hash: &BlockHash,
    ) -> Option<PooledBlockInfo> {
        let entry = self.accounts.get(address).map(|e| e.value().clone())?;
        let slot = lock(&entry.slot);
        slot.chains.get_block(hash).map(PooledBlockInfo::from_block)
    }
}
