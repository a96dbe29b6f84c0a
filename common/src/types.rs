//! Definition of ledger types shared by the pool, the store and the node

use crate::crypto::BlockHasher;
use crate::hash::{Address, BlockHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A block identified by its hash and its height in one chain
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HashHeight {
    pub hash: BlockHash,
    pub height: u64,
}

impl HashHeight {
    pub fn new(hash: BlockHash, height: u64) -> Self {
        Self { hash, height }
    }

    /// The virtual block below height 1 of every chain
    pub fn genesis() -> Self {
        Self::default()
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.hash.is_zero()
    }
}

impl fmt::Display for HashHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash.short(), self.height)
    }
}

/// Where a block entered the node from
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockSource {
    /// Produced or submitted on this node
    #[default]
    Local,

    /// Gossiped by a peer
    RemoteBroadcast,

    /// Delivered in answer to one of our fetch requests
    RemoteFetch,
}

/// Which chain an operation is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainTarget {
    Snapshot,
    Account(Address),
}

impl fmt::Display for ChainTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainTarget::Snapshot => write!(f, "snapshot"),
            ChainTarget::Account(address) => write!(f, "account {address}"),
        }
    }
}

/// Kind-specific part of an account block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountBlockKind {
    /// Value leaves the owning account towards `to`
    Send { to: Address, amount: u64 },

    /// Value arrives, matching exactly one send block on the sender's chain
    Receive { from: Address, send: HashHeight },
}

/// One block on an account chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBlock {
    pub address: Address,
    pub height: u64,
    pub prev_hash: BlockHash,
    pub kind: AccountBlockKind,

    /// Snapshot this block was built against; zero for genesis
    pub snapshot_hash: BlockHash,

    pub timestamp: u64,

    /// Opaque payload (contract data, signature material)
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,

    pub hash: BlockHash,
}

impl AccountBlock {
    /// Build a block and seal it with its content hash
    pub fn new(
        address: Address,
        height: u64,
        prev_hash: BlockHash,
        kind: AccountBlockKind,
        snapshot_hash: BlockHash,
        timestamp: u64,
        data: Vec<u8>,
    ) -> Self {
        let mut block = Self {
            address,
            height,
            prev_hash,
            kind,
            snapshot_hash,
            timestamp,
            data,
            hash: BlockHash::default(),
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = BlockHasher::new(b"lattice/account");
        hasher
            .fixed(self.address.as_ref())
            .u64(self.height)
            .fixed(self.prev_hash.as_ref());
        match &self.kind {
            AccountBlockKind::Send { to, amount } => {
                hasher.u8(0).fixed(to.as_ref()).u64(*amount);
            }
            AccountBlockKind::Receive { from, send } => {
                hasher.u8(1).fixed(from.as_ref()).fixed(send.hash.as_ref()).u64(send.height);
            }
        }
        hasher.fixed(self.snapshot_hash.as_ref()).u64(self.timestamp).bytes(&self.data);
        hasher.finish()
    }

    /// Structural check: the sealed hash matches the content
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn hash_height(&self) -> HashHeight {
        HashHeight::new(self.hash, self.height)
    }

    pub fn is_send(&self) -> bool {
        matches!(self.kind, AccountBlockKind::Send { .. })
    }

    pub fn is_receive(&self) -> bool {
        matches!(self.kind, AccountBlockKind::Receive { .. })
    }

    /// The send block this block receives, if it is a receive
    pub fn received_send(&self) -> Option<(Address, HashHeight)> {
        match self.kind {
            AccountBlockKind::Receive { from, send } => Some((from, send)),
            AccountBlockKind::Send { .. } => None,
        }
    }
}

/// One block on the snapshot chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlock {
    pub height: u64,
    pub prev_hash: BlockHash,
    pub timestamp: u64,

    /// Account heads confirmed by this snapshot
    pub content: BTreeMap<Address, HashHeight>,

    pub hash: BlockHash,
}

impl SnapshotBlock {
    pub fn new(
        height: u64,
        prev_hash: BlockHash,
        timestamp: u64,
        content: BTreeMap<Address, HashHeight>,
    ) -> Self {
        let mut block = Self {
            height,
            prev_hash,
            timestamp,
            content,
            hash: BlockHash::default(),
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = BlockHasher::new(b"lattice/snapshot");
        hasher.u64(self.height).fixed(self.prev_hash.as_ref()).u64(self.timestamp);
        hasher.u64(self.content.len() as u64);
        for (address, head) in &self.content {
            hasher.fixed(address.as_ref()).fixed(head.hash.as_ref()).u64(head.height);
        }
        hasher.finish()
    }

    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn hash_height(&self) -> HashHeight {
        HashHeight::new(self.hash, self.height)
    }
}

/// Everything physically removed by one ranged delete, ascending by height
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedBlocks {
    pub snapshots: Vec<SnapshotBlock>,
    pub accounts: BTreeMap<Address, Vec<AccountBlock>>,
}

impl DeletedBlocks {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.accounts.values().all(Vec::is_empty)
    }

    pub fn account_block_count(&self) -> usize {
        self.accounts.values().map(Vec::len).sum()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
