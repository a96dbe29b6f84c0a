//! Simulated peers: a remote ledger whose blocks reach the pool out of
//! order, partly lost, and on request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lattice_common::{
    AccountBlock, AccountBlockKind, Address, BlockHash, BlockSource, Broadcaster, ChainReader,
    ChainTarget, Fetcher, HashHeight, SnapshotBlock, Writer,
};
use lattice_module_block_pool::BlockPool;
use lattice_module_ledger_store::MemoryLedger;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// What the pool asked of the network
#[derive(Debug)]
pub enum Outbound {
    Fetch {
        target: ChainTarget,
        hash_height: HashHeight,
        count: u64,
    },
    Announce {
        address: Address,
        blocks: usize,
    },
    Snapshot(HashHeight),
}

/// Fetcher and broadcaster handing every call to the peer task
pub struct SimulatedNetwork {
    sender: mpsc::UnboundedSender<Outbound>,
}

impl SimulatedNetwork {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Fetcher for SimulatedNetwork {
    fn fetch_by_hash_height(
        &self,
        target: ChainTarget,
        hash_height: HashHeight,
        count: u64,
        _hint: Option<HashHeight>,
    ) {
        let _ = self.sender.send(Outbound::Fetch {
            target,
            hash_height,
            count,
        });
    }
}

impl Broadcaster for SimulatedNetwork {
    fn broadcast_snapshot_block(&self, block: &SnapshotBlock) {
        let _ = self.sender.send(Outbound::Snapshot(block.hash_height()));
    }

    fn broadcast_account_blocks(&self, address: &Address, blocks: &[AccountBlock]) {
        let _ = self.sender.send(Outbound::Announce {
            address: *address,
            blocks: blocks.len(),
        });
    }
}

/// Account chains as the rest of the network sees them
pub struct RemoteChains {
    pub ledger: MemoryLedger,
    pub addresses: Vec<Address>,
}

impl RemoteChains {
    /// `accounts` chains of `blocks` sends each, every one paying `payee`
    pub fn generate(accounts: usize, blocks: u64, payee: Address) -> Result<Self> {
        let ledger = MemoryLedger::new();
        let mut addresses = Vec::with_capacity(accounts);
        for n in 0..accounts {
            let mut bytes = [0u8; 20];
            bytes[..8].copy_from_slice(&(n as u64 + 1).to_be_bytes());
            let address = Address::new(bytes);
            let mut head = HashHeight::genesis();
            for height in 1..=blocks {
                let block = AccountBlock::new(
                    address,
                    height,
                    head.hash,
                    AccountBlockKind::Send {
                        to: payee,
                        amount: height,
                    },
                    BlockHash::default(),
                    height,
                    Vec::new(),
                );
                ledger.insert_account_block(&address, &block)?;
                head = block.hash_height();
            }
            addresses.push(address);
        }
        Ok(Self { ledger, addresses })
    }

    pub fn blocks(&self) -> Vec<AccountBlock> {
        self.addresses.iter().flat_map(|a| self.ledger.account_chain(a)).collect()
    }

    /// `count` blocks of `target` ending at `hash_height`, lowest first
    fn answer(&self, target: ChainTarget, hash_height: HashHeight, count: u64) -> Vec<AccountBlock> {
        let ChainTarget::Account(address) = target else {
            return Vec::new();
        };
        let Some(top) = self.ledger.get_account_block_by_hash(&hash_height.hash) else {
            return Vec::new();
        };
        let low = top.height.saturating_sub(count.max(1) - 1).max(1);
        (low..=top.height).filter_map(|h| self.ledger.account_block_at(&address, h)).collect()
    }
}

/// Gossip every remote block once in random order, losing some
pub async fn gossip(
    pool: Arc<BlockPool>,
    remote: Arc<RemoteChains>,
    loss: f64,
    pace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let deliveries: Vec<AccountBlock> = {
        let mut rng = rand::rng();
        let mut blocks = remote.blocks();
        blocks.shuffle(&mut rng);
        blocks.retain(|_| !rng.random_bool(loss.clamp(0.0, 1.0)));
        blocks
    };
    info!(blocks = deliveries.len(), "Gossiping remote blocks");

    for block in deliveries {
        pool.add_account_block(block.address, block, BlockSource::RemoteBroadcast);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(pace) => {}
        }
    }
    debug!("Gossip finished");
}

/// Answer fetch requests from the remote chains
pub async fn serve(
    pool: Arc<BlockPool>,
    remote: Arc<RemoteChains>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => return,
            request = outbound.recv() => request,
        };
        match request {
            Some(Outbound::Fetch {
                target,
                hash_height,
                count,
            }) => {
                let blocks = remote.answer(target, hash_height, count);
                debug!(%target, to = %hash_height, count, found = blocks.len(), "Answering fetch");
                for block in blocks {
                    pool.add_account_block(block.address, block, BlockSource::RemoteFetch);
                }
            }
            Some(Outbound::Announce { address, blocks }) => {
                debug!(%address, blocks, "Announced");
            }
            Some(Outbound::Snapshot(snapshot)) => {
                debug!(%snapshot, "Announced snapshot");
            }
            None => return,
        }
    }
}
