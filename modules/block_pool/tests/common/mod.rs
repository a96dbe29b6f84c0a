//! Shared harness for block pool integration tests.
//!
//! Wires a [`BlockPool`] to an in-memory ledger and to network doubles
//! that record every outbound call instead of talking to peers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lattice_common::{
    AccountBlock, AccountBlockKind, Address, BlockHash, Broadcaster, ChainTarget, Fetcher,
    HashHeight, SnapshotBlock, Verifier, VerifyError,
};
use lattice_module_block_pool::{BlockPool, Collaborators, PoolConfig};
use lattice_module_ledger_store::{LedgerConfig, LedgerVerifier, MemoryLedger};

/// Fetch request as seen by the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetch {
    pub target: ChainTarget,
    pub hash_height: HashHeight,
    pub count: u64,
}

#[derive(Default)]
pub struct Network {
    pub fetches: Mutex<Vec<Fetch>>,
    pub account_broadcasts: Mutex<Vec<(Address, Vec<HashHeight>)>>,
    pub snapshot_broadcasts: Mutex<Vec<HashHeight>>,
}

impl Network {
    pub fn fetches(&self) -> Vec<Fetch> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetches_of(&self, target: ChainTarget) -> Vec<Fetch> {
        self.fetches().into_iter().filter(|f| f.target == target).collect()
    }
}

impl Fetcher for Network {
    fn fetch_by_hash_height(
        &self,
        target: ChainTarget,
        hash_height: HashHeight,
        count: u64,
        _hint: Option<HashHeight>,
    ) {
        self.fetches.lock().unwrap().push(Fetch {
            target,
            hash_height,
            count,
        });
    }
}

impl Broadcaster for Network {
    fn broadcast_snapshot_block(&self, block: &SnapshotBlock) {
        self.snapshot_broadcasts.lock().unwrap().push(block.hash_height());
    }

    fn broadcast_account_blocks(&self, address: &Address, blocks: &[AccountBlock]) {
        let sent = blocks.iter().map(AccountBlock::hash_height).collect();
        self.account_broadcasts.lock().unwrap().push((*address, sent));
    }
}

/// Ledger verifier that also counts account block checks per address
pub struct CountingVerifier {
    inner: LedgerVerifier,
    account_checks: Mutex<BTreeMap<Address, usize>>,
}

impl CountingVerifier {
    pub fn account_checks(&self, address: &Address) -> usize {
        self.account_checks.lock().unwrap().get(address).copied().unwrap_or(0)
    }
}

impl Verifier for CountingVerifier {
    fn verify_account_block(&self, block: &AccountBlock) -> Result<(), VerifyError> {
        *self.account_checks.lock().unwrap().entry(block.address).or_default() += 1;
        self.inner.verify_account_block(block)
    }

    fn verify_snapshot_block(&self, block: &SnapshotBlock) -> Result<(), VerifyError> {
        self.inner.verify_snapshot_block(block)
    }

    fn verify_account_timeout(&self, head: &HashHeight, refer: &HashHeight) -> bool {
        self.inner.verify_account_timeout(head, refer)
    }
}

pub struct Harness {
    pub pool: BlockPool,
    pub ledger: Arc<MemoryLedger>,
    pub network: Arc<Network>,
    pub verifier: Arc<CountingVerifier>,
}

/// Loop timings short enough for tests; maintenance and refetching are
/// left to the test to drive
pub fn fast_config() -> PoolConfig {
    PoolConfig {
        insert_workers: 2,
        insert_period_ms: 1,
        insert_idle_backoff_ms: 5,
        compact_period_ms: 1,
        compact_idle_backoff_ms: 5,
        broadcast_interval_secs: 3600,
        eviction_interval_secs: 3600,
        prune_interval_secs: 3600,
        fetch_retry_ms: 60_000,
        ..PoolConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config(), 75)
}

pub fn harness_with(config: PoolConfig, account_timeout_snapshots: u64) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let network = Arc::new(Network::default());
    let verifier = Arc::new(CountingVerifier {
        inner: LedgerVerifier::new(
            ledger.clone(),
            &LedgerConfig {
                account_timeout_snapshots,
            },
        ),
        account_checks: Mutex::default(),
    });
    let pool = BlockPool::new(
        config,
        Collaborators {
            reader: ledger.clone(),
            writer: ledger.clone(),
            verifier: verifier.clone(),
            fetcher: network.clone(),
            broadcaster: network.clone(),
        },
    );
    Harness {
        pool,
        ledger,
        network,
        verifier,
    }
}

pub fn address(n: u8) -> Address {
    Address::new([n; 20])
}

/// Send blocks continuing `below` up to height `to`, built against `snapshot`
pub fn sends(
    address: Address,
    below: HashHeight,
    to: u64,
    snapshot: BlockHash,
    salt: u64,
) -> Vec<AccountBlock> {
    let mut prev = below;
    (below.height + 1..=to)
        .map(|height| {
            let block = AccountBlock::new(
                address,
                height,
                prev.hash,
                AccountBlockKind::Send {
                    to: Address::new([0xee; 20]),
                    amount: 1 + salt,
                },
                snapshot,
                salt * 1000 + height,
                vec![],
            );
            prev = block.hash_height();
            block
        })
        .collect()
}

pub fn account_chain(address: Address, to: u64) -> Vec<AccountBlock> {
    sends(address, HashHeight::genesis(), to, BlockHash::default(), 0)
}

pub fn send_to(from: Address, below: HashHeight, to: Address, amount: u64) -> AccountBlock {
    AccountBlock::new(
        from,
        below.height + 1,
        below.hash,
        AccountBlockKind::Send { to, amount },
        BlockHash::default(),
        amount,
        vec![],
    )
}

pub fn receive(address: Address, below: HashHeight, send: &AccountBlock) -> AccountBlock {
    AccountBlock::new(
        address,
        below.height + 1,
        below.hash,
        AccountBlockKind::Receive {
            from: send.address,
            send: send.hash_height(),
        },
        BlockHash::default(),
        send.timestamp + 1,
        vec![],
    )
}

/// Snapshot chain continuing `below` up to `to`, confirming nothing
pub fn empty_snapshots(below: HashHeight, to: u64, salt: u64) -> Vec<SnapshotBlock> {
    let mut prev = below;
    (below.height + 1..=to)
        .map(|height| {
            let block = SnapshotBlock::new(height, prev.hash, salt * 1000 + height, BTreeMap::new());
            prev = block.hash_height();
            block
        })
        .collect()
}

pub fn snapshot_on(
    below: HashHeight,
    timestamp: u64,
    content: BTreeMap<Address, HashHeight>,
) -> SnapshotBlock {
    SnapshotBlock::new(below.height + 1, below.hash, timestamp, content)
}

/// Commit a snapshot through the producer path
pub fn produce_snapshot(pool: &BlockPool, block: SnapshotBlock) {
    let guard = pool.lock();
    guard.add_direct_snapshot_block(block).unwrap();
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let the loops run for a while with nothing expected to change
pub fn settle() -> impl Future<Output = ()> {
    tokio::time::sleep(Duration::from_millis(100))
}
