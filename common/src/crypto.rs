//! Content hashing for ledger blocks

use crate::hash::BlockHash;
use blake2::{digest::consts::U32, Blake2b, Digest};

/// Incremental Blake2b-256 hasher over a canonical field encoding.
///
/// Integers are fed big-endian and variable-length fields are length
/// prefixed, so two different field sequences never share an encoding.
pub struct BlockHasher(Blake2b<U32>);

impl BlockHasher {
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(domain);
        Self(hasher)
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.0.update(value.to_be_bytes());
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.0.update([value]);
        self
    }

    pub fn fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update((bytes.len() as u64).to_be_bytes());
        self.0.update(bytes);
        self
    }

    pub fn finish(self) -> BlockHash {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&self.0.finalize());
        BlockHash::new(digest)
    }
}

/// Get a Blake2b-256 hash of arbitrary data
pub fn blake2b_256(data: &[u8]) -> BlockHash {
    let mut hasher = BlockHasher::new(b"");
    hasher.fixed(data);
    hasher.finish()
}
