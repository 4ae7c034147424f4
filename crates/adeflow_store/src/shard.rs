use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

/// Horizontal split of a run: this process handles shard `shard_id` of `shards`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    shards: u32,
    shard_id: u32,
}

impl ShardSpec {
    pub fn new(shards: u32, shard_id: u32) -> StoreResult<Self> {
        if shards == 0 || shard_id >= shards {
            return Err(StoreError::InvalidShard { shards, shard_id });
        }
        Ok(Self { shards, shard_id })
    }

    pub fn single() -> Self {
        Self {
            shards: 1,
            shard_id: 0,
        }
    }

    pub fn shards(&self) -> u32 {
        self.shards
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn is_sharded(&self) -> bool {
        self.shards > 1
    }

    /// True when `key` belongs to this shard.
    pub fn owns(&self, key: &str) -> bool {
        !self.is_sharded() || shard_of(key, self.shards) == self.shard_id
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self::single()
    }
}

/// Stable shard assignment: first 8 bytes of the blake3 digest, big-endian, modulo `shards`.
///
/// Independent of process, platform and run, so every shard agrees on ownership.
pub fn shard_of(key: &str, shards: u32) -> u32 {
    if shards <= 1 {
        return 0;
    }
    let digest = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shards)) as u32
}
