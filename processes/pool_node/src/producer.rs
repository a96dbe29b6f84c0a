//! Local block production: the node owns one account and produces the
//! snapshot chain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lattice_common::{
    AccountBlock, AccountBlockKind, Address, ChainReader, HashHeight, SnapshotBlock,
};
use lattice_module_block_pool::BlockPool;
use lattice_module_ledger_store::MemoryLedger;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Producer {
    pub pool: Arc<BlockPool>,
    pub ledger: Arc<MemoryLedger>,
    pub own: Address,
    pub payees: Vec<Address>,
}

impl Producer {
    /// Next block of the own account: a receive of some unreceived
    /// payment if one is persisted, else a send to the next payee
    fn next_account_block(&self, tick: u64) -> AccountBlock {
        let head = self.ledger.account_head(&self.own);
        let snapshot = self.ledger.head_snapshot();
        let payment = self.payees.iter().find_map(|payer| {
            self.ledger.account_chain(payer).into_iter().find(|b| {
                matches!(b.kind, AccountBlockKind::Send { to, .. } if to == self.own)
                    && self.ledger.received_by(&b.hash).is_none()
            })
        });
        let kind = match payment {
            Some(send) => AccountBlockKind::Receive {
                from: send.address,
                send: send.hash_height(),
            },
            None => AccountBlockKind::Send {
                to: self.payees[tick as usize % self.payees.len()],
                amount: 1,
            },
        };
        AccountBlock::new(
            self.own,
            head.height + 1,
            head.hash,
            kind,
            snapshot.hash,
            tick,
            Vec::new(),
        )
    }

    /// Snapshot confirming every account head not yet confirmed
    fn next_snapshot(&self, tick: u64) -> Option<SnapshotBlock> {
        let head = self.ledger.head_snapshot();
        let content: BTreeMap<Address, HashHeight> = self
            .ledger
            .addresses()
            .into_iter()
            .filter_map(|address| {
                let account = self.ledger.account_head(&address);
                (account.height > self.ledger.confirmed_height(&address))
                    .then_some((address, account))
            })
            .collect();
        if content.is_empty() {
            return None;
        }
        Some(SnapshotBlock::new(head.height + 1, head.hash, tick, content))
    }

    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            tick += 1;

            if !self.payees.is_empty() {
                let block = self.next_account_block(tick);
                let produced = block.hash_height();
                match self.pool.add_direct_account_block(self.own, block) {
                    Ok(()) => debug!(block = %produced, "Produced account block"),
                    Err(err) => debug!(%err, "Account block not produced"),
                }
            }

            // Account heads must not move between reading and confirming them
            let guard = self.pool.lock();
            let Some(snapshot) = self.next_snapshot(tick) else {
                continue;
            };
            let produced = snapshot.hash_height();
            let accounts = snapshot.content.len();
            match guard.add_direct_snapshot_block(snapshot) {
                Ok(()) => info!(snapshot = %produced, accounts, "Produced snapshot"),
                Err(err) => warn!(snapshot = %produced, %err, "Snapshot not produced"),
            }
        }
    }
}

/// Deterministic address of the local account
pub fn own_address() -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0x10;
    Address::new(bytes)
}
