//! Structural and linkage checks against the in-memory ledger

use std::sync::Arc;

use lattice_common::{
    AccountBlock, AccountBlockKind, BlockHash, ChainReader, HashHeight, SnapshotBlock, Verifier,
    VerifyError,
};

use crate::configuration::LedgerConfig;
use crate::memory_ledger::MemoryLedger;

/// Verifies blocks as the direct successor of persisted state.
///
/// Signatures and contract execution are out of scope; everything that
/// can be decided from the chains themselves is checked here.
pub struct LedgerVerifier {
    ledger: Arc<MemoryLedger>,
    account_timeout_snapshots: u64,
}

impl LedgerVerifier {
    pub fn new(ledger: Arc<MemoryLedger>, config: &LedgerConfig) -> Self {
        Self {
            ledger,
            account_timeout_snapshots: config.account_timeout_snapshots,
        }
    }

    fn check_extends(
        head: HashHeight,
        block: HashHeight,
        prev: &BlockHash,
    ) -> Result<(), VerifyError> {
        if block.height != head.height + 1 || *prev != head.hash {
            return Err(VerifyError::NotExtendingHead { block, head });
        }
        Ok(())
    }
}

impl Verifier for LedgerVerifier {
    fn verify_account_block(&self, block: &AccountBlock) -> Result<(), VerifyError> {
        let computed = block.compute_hash();
        if computed != block.hash {
            return Err(VerifyError::HashMismatch {
                sealed: block.hash,
                computed,
            });
        }

        let head = self.ledger.account_head(&block.address);
        Self::check_extends(head, block.hash_height(), &block.prev_hash)?;

        if !block.snapshot_hash.is_zero()
            && self.ledger.get_snapshot_block_by_hash(&block.snapshot_hash).is_none()
        {
            return Err(VerifyError::UnknownSnapshot(block.snapshot_hash));
        }

        if let AccountBlockKind::Receive { from, send } = block.kind {
            let source = self
                .ledger
                .account_block_at(&from, send.height)
                .filter(|b| b.hash == send.hash)
                .ok_or(VerifyError::UnknownSend(send))?;
            match source.kind {
                AccountBlockKind::Send { to, .. } if to == block.address => {}
                _ => {
                    return Err(VerifyError::NotASendTo {
                        send,
                        from,
                        to: block.address,
                    })
                }
            }
            if let Some((receiver, height)) = self.ledger.received_by(&send.hash) {
                return Err(VerifyError::AlreadyReceived {
                    send,
                    receiver,
                    height,
                });
            }
        }
        Ok(())
    }

    fn verify_snapshot_block(&self, block: &SnapshotBlock) -> Result<(), VerifyError> {
        let computed = block.compute_hash();
        if computed != block.hash {
            return Err(VerifyError::HashMismatch {
                sealed: block.hash,
                computed,
            });
        }

        let head = self.ledger.head_snapshot();
        Self::check_extends(head, block.hash_height(), &block.prev_hash)?;

        for (address, confirmed) in &block.content {
            let stored = self.ledger.account_block_at(address, confirmed.height);
            if stored.map(|b| b.hash) != Some(confirmed.hash) {
                return Err(VerifyError::ContentMissing {
                    address: *address,
                    head: *confirmed,
                });
            }
            let already = self.ledger.confirmed_height(address);
            if confirmed.height < already {
                return Err(VerifyError::ContentRegression {
                    address: *address,
                    confirmed: already,
                    proposed: confirmed.height,
                });
            }
        }
        Ok(())
    }

    fn verify_account_timeout(&self, head: &HashHeight, refer: &HashHeight) -> bool {
        head.height.saturating_sub(refer.height) <= self.account_timeout_snapshots
    }
}
