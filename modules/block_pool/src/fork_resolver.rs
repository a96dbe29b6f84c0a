//! Reconciling `current` with confirmed or authoritative chain data.

use lattice_common::{BlockSource, ChainTarget, HashHeight};
use tracing::{debug, info, warn};

use crate::chain_pool::ChainLocation;
use crate::pool_block::PoolBlock;
use crate::pool_core::{lock, PoolCore};
use crate::pool_error::PoolError;
use crate::scheduler::{FetchRequest, PoolSlot};

impl PoolCore {
    /// Try to make `hash_height` part of `current` without touching the store.
    ///
    /// Returns the target back when it can only be reached by rolling the
    /// store back, in which case the caller escalates to [`Self::fork_to`].
    /// A target that is nowhere in the pool is fetched instead.
    pub(crate) fn pending_to(
        &self,
        slot: &mut PoolSlot,
        target: ChainTarget,
        hash_height: &HashHeight,
        hint: Option<HashHeight>,
        requests: &mut Vec<FetchRequest>,
    ) -> Result<Option<HashHeight>, PoolError> {
        slot.chains.sync_with_disk();
        match slot.chains.find_in_tree(hash_height) {
            Some(ChainLocation::Disk | ChainLocation::Current) => Ok(None),
            Some(location @ ChainLocation::Snippet(id)) => {
                let fork = slot.chains.get_fork_point_by_chains(location)?;
                if fork.key_point.height < slot.chains.disk_head().height {
                    return Ok(Some(*hash_height));
                }
                slot.chains.current_modify_to_chain(id, hash_height)?;
                Ok(None)
            }
            None => {
                slot.request(target, *hash_height, self.config.default_fetch_count, hint, requests);
                Ok(None)
            }
        }
    }

    /// Authoritatively move `target`'s chain onto `hash_height`, rolling
    /// the store back as far as needed.
    pub(crate) fn fork_to(
        &self,
        target: ChainTarget,
        hash_height: HashHeight,
        hint: Option<HashHeight>,
    ) -> Result<(), PoolError> {
        let mut requests = Vec::new();
        let result = {
            let _exclusive = self.write_lock();
            self.fork_to_locked(target, hash_height, hint, &mut requests)
        };
        self.dispatch(requests);
        result
    }

    /// [`Self::fork_to`] for callers already holding the exclusive lock
    pub(crate) fn fork_to_locked(
        &self,
        target: ChainTarget,
        hash_height: HashHeight,
        hint: Option<HashHeight>,
        requests: &mut Vec<FetchRequest>,
    ) -> Result<(), PoolError> {
        let already = self.with_slot(target, |slot| {
            slot.chains.sync_with_disk();
            matches!(
                slot.chains.find_in_tree(&hash_height),
                Some(ChainLocation::Disk | ChainLocation::Current)
            )
        });
        if already || hash_height.height == 0 {
            debug!(%target, to = %hash_height, "Fork target already current");
            return Ok(());
        }

        info!(%target, to = %hash_height, "Forking chain");
        self.rollback_to_locked(target, hash_height.height - 1, true)?;

        let key_point = self.with_slot(target, |slot| -> Result<_, PoolError> {
            slot.chains.compact();
            match slot.chains.find_in_tree(&hash_height) {
                Some(location @ ChainLocation::Snippet(_)) => {
                    let fork = slot.chains.get_fork_point_by_chains(location)?;
                    Ok((fork.key_point.height < slot.chains.disk_head().height)
                        .then_some(fork.key_point))
                }
                _ => Ok(None),
            }
        })?;
        if let Some(key_point) = key_point {
            self.rollback_to_locked(target, key_point.height, true)?;
        }

        self.with_slot(target, |slot| {
            slot.chains.compact();
            match slot.chains.find_in_tree(&hash_height) {
                Some(ChainLocation::Disk | ChainLocation::Current) => Ok(()),
                Some(ChainLocation::Snippet(id)) => {
                    slot.chains.current_modify_to_chain(id, &hash_height)
                }
                None => {
                    slot.request(
                        target,
                        hash_height,
                        self.config.default_fetch_count,
                        hint,
                        requests,
                    );
                    slot.chains.current_modify_to_empty();
                    Ok(())
                }
            }
        })
    }

    /// Delete everything above `height` from `target`'s persisted chain,
    /// with the cascade the store applies, and re-absorb the deleted
    /// blocks into the pools.
    ///
    /// With `park_own` the blocks removed from `target` itself are kept
    /// out of `current` until something names them again. The exclusive
    /// lock must be held and no pool slot may be locked by the caller.
    pub(crate) fn rollback_to_locked(
        &self,
        target: ChainTarget,
        height: u64,
        park_own: bool,
    ) -> Result<(), PoolError> {
        let disk_head = match target {
            ChainTarget::Snapshot => self.reader.head_snapshot(),
            ChainTarget::Account(address) => self.reader.account_head(&address),
        };
        if disk_head.height <= height {
            return Ok(());
        }

        let deleted = self.writer.delete_to_height(target, height + 1).map_err(|err| {
            let err = PoolError::storage(err);
            warn!(%target, height, %err, "Rollback refused by store");
            err
        })?;
        self.version.inc();
        info!(
            %target,
            height,
            snapshots = deleted.snapshots.len(),
            account_blocks = deleted.account_block_count(),
            version = self.version.val(),
            "Rolled back"
        );

        if !deleted.snapshots.is_empty() || target == ChainTarget::Snapshot {
            let blocks = deleted
                .snapshots
                .into_iter()
                .map(|b| PoolBlock::snapshot(b, &self.version, BlockSource::Local))
                .collect();
            let park = park_own && target == ChainTarget::Snapshot;
            lock(&self.snapshot).chains.rollback_current(blocks, park);
        }

        let mut touched: Vec<_> = deleted.accounts.keys().copied().collect();
        if let ChainTarget::Account(address) = target {
            if !deleted.accounts.contains_key(&address) {
                touched.push(address);
            }
        }
        for (address, blocks) in deleted.accounts {
            let blocks = blocks
                .into_iter()
                .map(|b| PoolBlock::account(b, &self.version, BlockSource::Local))
                .collect();
            let park = park_own && target == ChainTarget::Account(address);
            let entry = self.account_entry(&address);
            lock(&entry.slot).chains.rollback_current(blocks, park);
        }
        for address in touched {
            self.block_list.remove(&address);
        }
        Ok(())
    }
}
