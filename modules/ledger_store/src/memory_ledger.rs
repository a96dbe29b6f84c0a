//! In-memory persisted ledger.
//!
//! State lives in persistent collections so every multi-step mutation is
//! staged on a cheap clone and swapped in only once it has fully succeeded.

use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use imbl::{HashMap, Vector};
use lattice_common::{
    AccountBlock, Address, BlockHash, ChainReader, ChainTarget, DeletedBlocks, HashHeight,
    SnapshotBlock, Writer,
};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Clone, Default)]
struct LedgerState {
    /// Snapshot chain, index = height - 1
    snapshots: Vector<SnapshotBlock>,
    snapshot_index: HashMap<BlockHash, u64>,

    /// Account chains, index = height - 1
    accounts: HashMap<Address, Vector<AccountBlock>>,
    account_index: HashMap<BlockHash, (Address, u64)>,

    /// Send hash -> receiving (address, height)
    received: HashMap<BlockHash, (Address, u64)>,
}

/// Heights from which each chain is deleted
#[derive(Debug, Default)]
struct DeletePlan {
    snapshot_from: Option<u64>,
    accounts: BTreeMap<Address, u64>,
}

impl DeletePlan {
    fn lower_snapshot(&mut self, height: u64) -> bool {
        match self.snapshot_from {
            Some(from) if from <= height => false,
            _ => {
                self.snapshot_from = Some(height);
                true
            }
        }
    }

    fn lower_account(&mut self, address: Address, height: u64) -> bool {
        match self.accounts.get(&address) {
            Some(from) if *from <= height => false,
            _ => {
                self.accounts.insert(address, height);
                true
            }
        }
    }
}

impl LedgerState {
    fn snapshot_head(&self) -> HashHeight {
        self.snapshots.last().map(SnapshotBlock::hash_height).unwrap_or_default()
    }

    fn snapshot_at(&self, height: u64) -> Option<&SnapshotBlock> {
        height.checked_sub(1).and_then(|i| self.snapshots.get(i as usize))
    }

    fn account_head(&self, address: &Address) -> HashHeight {
        self.accounts
            .get(address)
            .and_then(|chain| chain.last())
            .map(AccountBlock::hash_height)
            .unwrap_or_default()
    }

    fn account_at(&self, address: &Address, height: u64) -> Option<&AccountBlock> {
        let chain = self.accounts.get(address)?;
        height.checked_sub(1).and_then(|i| chain.get(i as usize))
    }

    /// Highest height of `address` confirmed by snapshots 1..=`up_to`
    fn confirmed_height(&self, address: &Address, up_to: u64) -> u64 {
        let up_to = (up_to as usize).min(self.snapshots.len());
        (0..up_to)
            .rev()
            .find_map(|i| self.snapshots.get(i).and_then(|s| s.content.get(address)))
            .map(|head| head.height)
            .unwrap_or(0)
    }

    /// Lowest snapshot confirming `address` at `height` or above
    fn first_snapshot_confirming(&self, address: &Address, height: u64) -> Option<u64> {
        self.snapshots
            .iter()
            .find(|snapshot| snapshot.content.get(address).is_some_and(|h| h.height >= height))
            .map(|snapshot| snapshot.height)
    }

    fn push_account(&mut self, block: &AccountBlock) -> Result<()> {
        if !block.verify_hash() {
            bail!("account block {} has a corrupt hash", block.hash_height());
        }
        let head = self.account_head(&block.address);
        if block.height != head.height + 1 || block.prev_hash != head.hash {
            bail!(
                "account block {} does not extend head {head} of {}",
                block.hash_height(),
                block.address
            );
        }
        if self.account_index.contains_key(&block.hash) {
            bail!("account block {} already stored", block.hash_height());
        }
        if let Some((from, send)) = block.received_send() {
            match self.account_at(&from, send.height) {
                Some(source) if source.hash == send.hash => {}
                _ => bail!("receive {} names missing send {send}", block.hash_height()),
            }
            if let Some((receiver, height)) = self.received.get(&send.hash) {
                bail!("send {send} already received by {receiver} at {height}");
            }
            self.received.insert(send.hash, (block.address, block.height));
        }

        self.account_index.insert(block.hash, (block.address, block.height));
        let mut chain = self.accounts.get(&block.address).cloned().unwrap_or_default();
        chain.push_back(block.clone());
        self.accounts.insert(block.address, chain);
        Ok(())
    }

    fn push_snapshot(&mut self, block: &SnapshotBlock) -> Result<()> {
        if !block.verify_hash() {
            bail!("snapshot block {} has a corrupt hash", block.hash_height());
        }
        let head = self.snapshot_head();
        if block.height != head.height + 1 || block.prev_hash != head.hash {
            bail!("snapshot block {} does not extend head {head}", block.hash_height());
        }
        for (address, confirmed) in &block.content {
            match self.account_at(address, confirmed.height) {
                Some(stored) if stored.hash == confirmed.hash => {}
                _ => bail!(
                    "snapshot {} confirms missing block {confirmed} of {address}",
                    block.hash_height()
                ),
            }
        }
        self.snapshot_index.insert(block.hash, block.height);
        self.snapshots.push_back(block.clone());
        Ok(())
    }

    fn plan_delete(&self, target: ChainTarget, height: u64) -> DeletePlan {
        let mut plan = DeletePlan::default();
        match target {
            ChainTarget::Snapshot => plan.lower_snapshot(height),
            ChainTarget::Account(address) => plan.lower_account(address, height),
        };

        // Heights only ever go down and are bounded by 1, so this terminates
        loop {
            let mut changed = false;

            if let Some(from) = plan.snapshot_from {
                let skip = from.saturating_sub(1) as usize;
                let mut removed = HashSet::new();
                for snapshot in self.snapshots.iter().skip(skip) {
                    removed.insert(snapshot.hash);
                    for address in snapshot.content.keys() {
                        let keep = self.confirmed_height(address, from - 1);
                        changed |= plan.lower_account(*address, keep + 1);
                    }
                }
                for (address, chain) in self.accounts.iter() {
                    if let Some(block) = chain.iter().find(|b| removed.contains(&b.snapshot_hash)) {
                        changed |= plan.lower_account(*address, block.height);
                    }
                }
            }

            for (address, from) in plan.accounts.clone() {
                let Some(chain) = self.accounts.get(&address) else {
                    continue;
                };
                for block in chain.iter().skip(from.saturating_sub(1) as usize) {
                    if let Some((receiver, height)) = self.received.get(&block.hash) {
                        changed |= plan.lower_account(*receiver, *height);
                    }
                }
                if let Some(snapshot) = self.first_snapshot_confirming(&address, from) {
                    changed |= plan.lower_snapshot(snapshot);
                }
            }

            if !changed {
                break;
            }
        }
        plan
    }

    fn apply_delete(&mut self, plan: &DeletePlan) -> DeletedBlocks {
        let mut deleted = DeletedBlocks::default();

        if let Some(from) = plan.snapshot_from {
            let keep = from.saturating_sub(1) as usize;
            if keep < self.snapshots.len() {
                let removed = self.snapshots.split_off(keep);
                for block in removed.iter() {
                    self.snapshot_index.remove(&block.hash);
                }
                deleted.snapshots = removed.into_iter().collect();
            }
        }

        for (address, from) in &plan.accounts {
            let Some(chain) = self.accounts.get_mut(address) else {
                continue;
            };
            let keep = from.saturating_sub(1) as usize;
            if keep >= chain.len() {
                continue;
            }
            let removed = chain.split_off(keep);
            let mut blocks = Vec::with_capacity(removed.len());
            for block in removed.into_iter() {
                self.account_index.remove(&block.hash);
                // Reopen the send this block had matched
                if let Some((_, send)) = block.received_send() {
                    self.received.remove(&send.hash);
                }
                blocks.push(block);
            }
            deleted.accounts.insert(*address, blocks);
        }

        deleted
    }

    /// Cross-chain references all resolve
    fn check_consistency(&self) -> Result<()> {
        for snapshot in self.snapshots.iter() {
            for (address, head) in &snapshot.content {
                if self.account_at(address, head.height).map(|b| b.hash) != Some(head.hash) {
                    bail!("snapshot {} dangles on {address}", snapshot.hash_height());
                }
            }
        }
        for (send, (receiver, height)) in self.received.iter() {
            let matches = self
                .account_at(receiver, *height)
                .and_then(AccountBlock::received_send)
                .is_some_and(|(_, s)| s.hash == *send);
            if !matches || !self.account_index.contains_key(send) {
                bail!("receive marker for {send} dangles");
            }
        }
        Ok(())
    }
}

/// Size summary of a ledger
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub snapshot_head: HashHeight,
    pub accounts: usize,
    pub account_blocks: usize,
    pub open_receives: usize,
}

/// Ledger kept entirely in memory
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiving (address, height) of a send block, if it has been received
    pub fn received_by(&self, send_hash: &BlockHash) -> Option<(Address, u64)> {
        self.read().received.get(send_hash).copied()
    }

    /// Highest height of `address` confirmed by the head snapshot
    pub fn confirmed_height(&self, address: &Address) -> u64 {
        let state = self.read();
        state.confirmed_height(address, state.snapshots.len() as u64)
    }

    pub fn account_chain(&self, address: &Address) -> Vec<AccountBlock> {
        self.read().accounts.get(address).map(|c| c.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.read().accounts.keys().copied().collect()
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.read();
        LedgerStats {
            snapshot_head: state.snapshot_head(),
            accounts: state.accounts.len(),
            account_blocks: state.account_index.len(),
            open_receives: state.received.len(),
        }
    }
}

impl ChainReader for MemoryLedger {
    fn head_snapshot(&self) -> HashHeight {
        self.read().snapshot_head()
    }

    fn snapshot_block_at(&self, height: u64) -> Option<SnapshotBlock> {
        self.read().snapshot_at(height).cloned()
    }

    fn get_snapshot_block_by_hash(&self, hash: &BlockHash) -> Option<SnapshotBlock> {
        let state = self.read();
        let height = state.snapshot_index.get(hash)?;
        state.snapshot_at(*height).cloned()
    }

    fn account_head(&self, address: &Address) -> HashHeight {
        self.read().account_head(address)
    }

    fn account_block_at(&self, address: &Address, height: u64) -> Option<AccountBlock> {
        self.read().account_at(address, height).cloned()
    }

    fn get_account_block_by_hash(&self, hash: &BlockHash) -> Option<AccountBlock> {
        let state = self.read();
        let (address, height) = state.account_index.get(hash)?;
        state.account_at(address, *height).cloned()
    }

    fn get_first_unconfirmed_block(
        &self,
        address: &Address,
        snapshot: &HashHeight,
    ) -> Option<AccountBlock> {
        let state = self.read();
        let confirmed = state.confirmed_height(address, snapshot.height);
        state.account_at(address, confirmed + 1).cloned()
    }

    fn get_unconfirmed_blocks(&self, address: &Address) -> Vec<AccountBlock> {
        let state = self.read();
        let confirmed = state.confirmed_height(address, state.snapshots.len() as u64);
        state
            .accounts
            .get(address)
            .map(|chain| chain.iter().skip(confirmed as usize).cloned().collect())
            .unwrap_or_default()
    }
}

impl Writer for MemoryLedger {
    fn insert_account_block(&self, address: &Address, block: &AccountBlock) -> Result<()> {
        self.insert_account_blocks(address, block, &[])
    }

    fn insert_account_blocks(
        &self,
        address: &Address,
        head: &AccountBlock,
        tail: &[AccountBlock],
    ) -> Result<()> {
        let mut state = self.write();
        let mut next = state.clone();
        for block in std::iter::once(head).chain(tail) {
            if block.address != *address {
                bail!("block {} belongs to {}, not {address}", block.hash_height(), block.address);
            }
            next.push_account(block)?;
        }
        *state = next;
        debug!(%address, height = head.height, count = 1 + tail.len(), "Stored account blocks");
        Ok(())
    }

    fn insert_snapshot_block(&self, block: &SnapshotBlock) -> Result<()> {
        let mut state = self.write();
        let mut next = state.clone();
        next.push_snapshot(block)?;
        *state = next;
        debug!(height = block.height, hash = %block.hash, "Stored snapshot block");
        Ok(())
    }

    fn delete_to_height(&self, target: ChainTarget, height: u64) -> Result<DeletedBlocks> {
        if height == 0 {
            bail!("cannot delete genesis of {target}");
        }
        let mut state = self.write();
        let plan = state.plan_delete(target, height);
        let mut next = state.clone();
        let deleted = next.apply_delete(&plan);
        next.check_consistency()?;
        *state = next;

        info!(
            %target,
            height,
            snapshots = deleted.snapshots.len(),
            account_blocks = deleted.account_block_count(),
            accounts = deleted.accounts.len(),
            "Deleted persisted blocks"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::AccountBlockKind;

    fn address(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn send(ledger: &MemoryLedger, from: u8, to: u8) -> AccountBlock {
        let head = ledger.account_head(&address(from));
        AccountBlock::new(
            address(from),
            head.height + 1,
            head.hash,
            AccountBlockKind::Send {
                to: address(to),
                amount: 1,
            },
            ledger.head_snapshot().hash,
            head.height + 1,
            vec![],
        )
    }

    fn receive(ledger: &MemoryLedger, at: u8, source: &AccountBlock) -> AccountBlock {
        let head = ledger.account_head(&address(at));
        AccountBlock::new(
            address(at),
            head.height + 1,
            head.hash,
            AccountBlockKind::Receive {
                from: source.address,
                send: source.hash_height(),
            },
            ledger.head_snapshot().hash,
            head.height + 1,
            vec![],
        )
    }

    fn store(ledger: &MemoryLedger, block: &AccountBlock) {
        ledger.insert_account_block(&block.address, block).unwrap();
    }

    fn snapshot(ledger: &MemoryLedger, content: &[&AccountBlock]) -> SnapshotBlock {
        let head = ledger.head_snapshot();
        let content = content.iter().map(|b| (b.address, b.hash_height())).collect();
        let block = SnapshotBlock::new(head.height + 1, head.hash, head.height + 1, content);
        ledger.insert_snapshot_block(&block).unwrap();
        block
    }

    #[test]
    fn insert_requires_linkage() {
        let ledger = MemoryLedger::new();
        let first = send(&ledger, 1, 2);
        store(&ledger, &first);
        assert_eq!(ledger.account_head(&address(1)), first.hash_height());

        // Same height again no longer extends the head
        let stale = AccountBlock::new(
            address(1),
            1,
            BlockHash::default(),
            AccountBlockKind::Send {
                to: address(3),
                amount: 5,
            },
            BlockHash::default(),
            9,
            vec![],
        );
        assert!(ledger.insert_account_block(&address(1), &stale).is_err());
        assert_eq!(ledger.account_chain(&address(1)).len(), 1);
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let ledger = MemoryLedger::new();
        let first = send(&ledger, 1, 2);
        let mut broken = first.clone();
        broken.height = 5;
        assert!(ledger.insert_account_blocks(&address(1), &first, &[broken]).is_err());
        assert_eq!(ledger.account_head(&address(1)), HashHeight::genesis());
    }

    #[test]
    fn double_receive_is_refused() {
        let ledger = MemoryLedger::new();
        let s = send(&ledger, 1, 2);
        store(&ledger, &s);
        let r = receive(&ledger, 2, &s);
        store(&ledger, &r);
        let again = receive(&ledger, 2, &s);
        assert!(ledger.insert_account_block(&address(2), &again).is_err());
        assert_eq!(ledger.received_by(&s.hash), Some((address(2), 1)));
    }

    #[test]
    fn deleting_a_receive_reopens_its_send() {
        let ledger = MemoryLedger::new();
        let s = send(&ledger, 1, 2);
        store(&ledger, &s);
        let r = receive(&ledger, 2, &s);
        store(&ledger, &r);

        let deleted = ledger.delete_to_height(ChainTarget::Account(address(2)), 1).unwrap();
        assert_eq!(deleted.accounts[&address(2)], vec![r]);
        assert!(!deleted.accounts.contains_key(&address(1)));
        assert_eq!(ledger.received_by(&s.hash), None);
        assert_eq!(ledger.account_head(&address(1)), s.hash_height());
    }

    #[test]
    fn deleting_a_received_send_cascades_to_receiver() {
        let ledger = MemoryLedger::new();
        let s = send(&ledger, 1, 2);
        store(&ledger, &s);
        let r = receive(&ledger, 2, &s);
        store(&ledger, &r);
        let after = send(&ledger, 2, 3);
        store(&ledger, &after);

        let deleted = ledger.delete_to_height(ChainTarget::Account(address(1)), 1).unwrap();
        assert_eq!(deleted.accounts[&address(1)].len(), 1);
        assert_eq!(deleted.accounts[&address(2)].len(), 2);
        assert_eq!(ledger.account_head(&address(2)), HashHeight::genesis());
        assert_eq!(ledger.stats().open_receives, 0);
    }

    #[test]
    fn deleting_a_confirmed_block_drops_its_snapshot() {
        let ledger = MemoryLedger::new();
        let a1 = send(&ledger, 1, 2);
        store(&ledger, &a1);
        let s1 = snapshot(&ledger, &[&a1]);
        let a2 = send(&ledger, 1, 2);
        store(&ledger, &a2);
        snapshot(&ledger, &[&a2]);

        let deleted = ledger.delete_to_height(ChainTarget::Account(address(1)), 2).unwrap();
        assert_eq!(deleted.snapshots.len(), 1);
        assert_eq!(ledger.head_snapshot(), s1.hash_height());
        assert_eq!(ledger.confirmed_height(&address(1)), 1);
    }

    #[test]
    fn deleting_snapshots_removes_what_they_confirmed() {
        let ledger = MemoryLedger::new();
        let a1 = send(&ledger, 1, 2);
        store(&ledger, &a1);
        let s1 = snapshot(&ledger, &[&a1]);
        let a2 = send(&ledger, 1, 2);
        store(&ledger, &a2);
        let a3 = send(&ledger, 1, 2);
        store(&ledger, &a3);
        snapshot(&ledger, &[&a3]);

        let deleted = ledger.delete_to_height(ChainTarget::Snapshot, 2).unwrap();
        assert_eq!(deleted.snapshots.len(), 1);
        assert_eq!(deleted.accounts[&address(1)], vec![a2, a3]);
        assert_eq!(ledger.head_snapshot(), s1.hash_height());
        assert_eq!(ledger.account_head(&address(1)), a1.hash_height());
    }

    #[test]
    fn unconfirmed_blocks_follow_the_last_confirmation() {
        let ledger = MemoryLedger::new();
        let a1 = send(&ledger, 1, 2);
        store(&ledger, &a1);
        snapshot(&ledger, &[&a1]);
        let a2 = send(&ledger, 1, 2);
        store(&ledger, &a2);

        let head = ledger.head_snapshot();
        assert_eq!(ledger.get_first_unconfirmed_block(&address(1), &head), Some(a2.clone()));
        assert_eq!(ledger.get_unconfirmed_blocks(&address(1)), vec![a2]);
        assert_eq!(ledger.get_first_unconfirmed_block(&address(9), &head), None);
    }

    #[test]
    fn genesis_cannot_be_deleted() {
        let ledger = MemoryLedger::new();
        assert!(ledger.delete_to_height(ChainTarget::Snapshot, 0).is_err());
    }
}
