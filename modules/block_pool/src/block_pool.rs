//! Lattice block pool module
//! Fork-aware pool reconciling snapshot and account blocks with the persisted ledger

pub mod candidate_chain;
pub mod chain_pool;
pub mod configuration;
pub mod fail_stat;
pub mod fork_resolver;
pub mod fork_version;
pub mod pool_block;
pub mod pool_core;
pub mod pool_error;
pub mod scheduler;

use std::sync::{Arc, Mutex, RwLockWriteGuard};
use std::time::Duration;

use futures::future::join_all;
use lattice_common::{
    AccountBlock, Address, BlockHash, BlockSource, ChainTarget, HashHeight, SnapshotBlock,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};

pub use chain_pool::{ChainDetail, ChainKind, ChainPoolInfo};
pub use configuration::PoolConfig;
pub use pool_block::BlockPayload;
pub use pool_core::{Collaborators, PoolInfo, PooledBlockInfo};
pub use pool_error::PoolError;

use pool_core::{lock, PoolCore};

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// The block pool: buffers blocks from the network and from local
/// producers, resolves forks and commits blocks to the ledger in order.
pub struct BlockPool {
    core: Arc<PoolCore>,
    running: Mutex<Option<Running>>,
}

impl BlockPool {
    pub fn new(config: PoolConfig, collaborators: Collaborators) -> Self {
        Self {
            core: Arc::new(PoolCore::new(config, collaborators)),
            running: Mutex::new(None),
        }
    }

    /// Spawn the insert, compaction and maintenance loops. Must be called
    /// inside a tokio runtime; a second call while running does nothing.
    pub fn start(&self) -> Result<(), PoolError> {
        if let Some(message) = self.core.fatal_error() {
            return Err(PoolError::Halted(message));
        }
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let (shutdown, watcher) = watch::channel(false);
        let workers = self.core.config.insert_workers.max(1);
        let mut handles = Vec::with_capacity(workers + 3);
        handles.push(tokio::spawn(
            run_snapshot_inserter(self.core.clone(), watcher.clone())
                .instrument(info_span!("snapshot_inserter")),
        ));
        for worker in 0..workers {
            handles.push(tokio::spawn(
                run_account_inserter(self.core.clone(), watcher.clone())
                    .instrument(info_span!("account_inserter", worker)),
            ));
        }
        handles.push(tokio::spawn(
            run_compactor(self.core.clone(), watcher.clone()).instrument(info_span!("compactor")),
        ));
        handles.push(tokio::spawn(
            run_maintenance(self.core.clone(), watcher).instrument(info_span!("maintenance")),
        ));

        info!(workers, "Block pool started");
        *running = Some(Running { shutdown, handles });
        Ok(())
    }

    /// Signal every loop to finish and wait until all of them have.
    ///
    /// Returns the storage failure that halted the pool, if any.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            for result in join_all(running.handles).await {
                if let Err(err) = result {
                    error!(%err, "Block pool loop panicked");
                }
            }
            info!("Block pool stopped");
        }
        match self.core.fatal_error() {
            Some(message) => Err(PoolError::Halted(message)),
            None => Ok(()),
        }
    }

    pub async fn restart(&self) -> Result<(), PoolError> {
        self.stop().await?;
        self.start()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    // Network ingestion: buffered, never reports errors

    pub fn add_snapshot_block(&self, block: SnapshotBlock, source: BlockSource) {
        self.core.add_snapshot_block(block, source);
    }

    pub fn add_account_block(&self, address: Address, block: AccountBlock, source: BlockSource) {
        self.core.add_account_block(address, block, source);
    }

    pub fn add_account_blocks(
        &self,
        address: Address,
        blocks: Vec<AccountBlock>,
        source: BlockSource,
    ) {
        for block in blocks {
            self.core.add_account_block(address, block, source);
        }
    }

    // Local submission

    pub fn add_direct_account_block(
        &self,
        address: Address,
        block: AccountBlock,
    ) -> Result<(), PoolError> {
        self.core.insert_direct_account_block(address, block)
    }

    pub fn add_direct_account_blocks(
        &self,
        address: Address,
        received: AccountBlock,
        sends: Vec<AccountBlock>,
    ) -> Result<(), PoolError> {
        self.core.insert_direct_account_blocks(address, received, sends)
    }

    /// True if `address` already has a queued receive of `send_hash`
    pub fn exist_in_pool(&self, address: &Address, send_hash: &BlockHash) -> bool {
        self.core.exist_in_pool(address, send_hash)
    }

    /// Take the pool-wide lock for a multi-step block production.
    ///
    /// All insertion, compaction and fork handling waits until the guard
    /// is dropped; network ingestion keeps buffering.
    pub fn lock(&self) -> ProducerGuard<'_> {
        ProducerGuard {
            core: &self.core,
            _exclusive: self.core.write_lock(),
        }
    }

    // Fork handling

    /// Reconcile `address`'s pool with a confirmed head without touching
    /// the store. Returns the target back if only a fork can reach it.
    pub fn pending_account_to(
        &self,
        address: Address,
        hash_height: HashHeight,
        hint: Option<HashHeight>,
    ) -> Result<Option<HashHeight>, PoolError> {
        let mut requests = Vec::new();
        let result = {
            let _shared = self.core.read_lock();
            let entry = self.core.account_entry(&address);
            let mut slot = lock(&entry.slot);
            self.core.pending_to(
                &mut slot,
                ChainTarget::Account(address),
                &hash_height,
                hint,
                &mut requests,
            )
        };
        self.core.dispatch(requests);
        result
    }

    pub fn fork_account_to(&self, address: Address, hash_height: HashHeight) -> Result<(), PoolError> {
        self.core.fork_to(ChainTarget::Account(address), hash_height, None)
    }

    /// Switch the snapshot chain to a competing branch the network reported
    pub fn fork_snapshot_to(&self, hash_height: HashHeight) -> Result<(), PoolError> {
        self.core.fork_to(ChainTarget::Snapshot, hash_height, None)
    }

    /// Delete `address`'s persisted blocks above `height`
    pub fn rollback_account_to(&self, address: Address, height: u64) -> Result<(), PoolError> {
        let _exclusive = self.core.write_lock();
        self.core.rollback_to_locked(ChainTarget::Account(address), height, true)
    }

    // Maintenance, normally driven by the loops

    pub fn compact(&self) -> usize {
        self.core.compact_pass()
    }

    pub fn evict_timed_out(&self) -> Result<usize, PoolError> {
        self.core.evict_timed_out()
    }

    pub fn prune(&self) -> usize {
        self.core.prune()
    }

    pub fn rebroadcast(&self) -> usize {
        self.core.rebroadcast()
    }

    // Diagnostics

    pub fn info(&self) -> PoolInfo {
        self.core.info()
    }

    pub fn snapshot_chain_detail(&self) -> Vec<ChainDetail> {
        self.core.snapshot_chain_detail()
    }

    pub fn account_chain_detail(&self, address: &Address) -> Vec<ChainDetail> {
        self.core.account_chain_detail(address)
    }

    pub fn snapshot_pending_num(&self) -> usize {
        self.core.snapshot_pending_num()
    }

    pub fn account_pending_num(&self, address: &Address) -> usize {
        self.core.account_pending_num(address)
    }

    pub fn snapshot_block_info(&self, hash: &BlockHash) -> Option<PooledBlockInfo> {
        self.core.snapshot_block_info(hash)
    }

    pub fn account_block_info(&self, address: &Address, hash: &BlockHash) -> Option<PooledBlockInfo> {
        self.core.account_block_info(address, hash)
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.core.fatal_error()
    }
}

/// Exclusive hold on the pool for a block producer
pub struct ProducerGuard<'a> {
    core: &'a PoolCore,
    _exclusive: RwLockWriteGuard<'a, ()>,
}

impl ProducerGuard<'_> {
    /// Insert a snapshot block this node produced
    pub fn add_direct_snapshot_block(&self, block: SnapshotBlock) -> Result<(), PoolError> {
        self.core.insert_direct_snapshot_block(block)
    }

    pub fn rollback_account_to(&self, address: Address, height: u64) -> Result<(), PoolError> {
        self.core.rollback_to_locked(ChainTarget::Account(address), height, true)
    }

    pub fn fork_account_to(&self, address: Address, hash_height: HashHeight) -> Result<(), PoolError> {
        let mut requests = Vec::new();
        let result = self.core.fork_to_locked(
            ChainTarget::Account(address),
            hash_height,
            None,
            &mut requests,
        );
        self.core.dispatch(requests);
        result
    }
}

/// Sleep for `wait`, waking early on new blocks when `idle`.
/// False once shutdown is signalled or the pool halted.
async fn pause(core: &PoolCore, shutdown: &mut watch::Receiver<bool>, wait: Duration, idle: bool) -> bool {
    tokio::select! {
        _ = shutdown.changed() => return false,
        _ = core.new_blocks.notified(), if idle => {}
        _ = tokio::time::sleep(wait) => {}
    }
    !*shutdown.borrow() && !core.is_halted()
}

async fn run_snapshot_inserter(core: Arc<PoolCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let advanced = match core.snapshot_pass() {
            Ok(advanced) => advanced,
            Err(err) => {
                error!(%err, "Snapshot insertion stopped");
                return;
            }
        };
        let wait = if advanced {
            core.config.insert_period()
        } else {
            core.config.insert_idle_backoff()
        };
        if !pause(&core, &mut shutdown, wait, !advanced).await {
            return;
        }
    }
}

async fn run_account_inserter(core: Arc<PoolCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let committed = match core.account_pass() {
            Ok(committed) => committed,
            Err(err) => {
                error!(%err, "Account insertion stopped");
                return;
            }
        };
        let wait = if committed > 0 {
            core.config.insert_period()
        } else {
            core.config.insert_idle_backoff()
        };
        if !pause(&core, &mut shutdown, wait, committed == 0).await {
            return;
        }
    }
}

async fn run_compactor(core: Arc<PoolCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let advanced = core.compact_pass();
        let wait = if advanced > 0 {
            core.config.compact_period()
        } else {
            core.config.compact_idle_backoff()
        };
        if !pause(&core, &mut shutdown, wait, advanced == 0).await {
            return;
        }
    }
}

async fn run_maintenance(core: Arc<PoolCore>, mut shutdown: watch::Receiver<bool>) {
    let every = |period: Duration| {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    };
    let mut broadcast = every(core.config.broadcast_interval());
    let mut eviction = every(core.config.eviction_interval());
    let mut prune = every(core.config.prune_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = broadcast.tick() => {
                core.rebroadcast();
            }
            _ = eviction.tick() => {
                if let Err(err) = core.evict_timed_out() {
                    warn!(%err, "Eviction of timed out blocks failed");
                }
            }
            _ = prune.tick() => {
                core.prune();
            }
        }
        if *shutdown.borrow() || core.is_halted() {
            return;
        }
    }
}
