//! Rank topology for tensor parallelism.
//!
//! A [`ShardSpec`] is this worker's position in the tensor-parallel group.
//! It is fixed for the lifetime of the worker and handed to every component
//! constructor, so no component ever queries ambient distributed state.

use super::error::{DistributedError, Result};

/// This worker's `(rank, world_size)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSpec {
    rank: usize,
    world_size: usize,
}

impl ShardSpec {
    /// Create a shard spec, validating `rank < world_size`.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize);
        }
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }

    /// The single-rank spec: rank 0 of 1.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether this is the coordinator (rank 0).
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Whether this is a single-rank group (no sharding, no reductions).
    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }

    /// Contiguous range `[start, start + len)` owned by this rank when `size`
    /// items are split evenly. Returns `None` if `size` is not divisible.
    pub fn even_range(&self, size: usize) -> Option<(usize, usize)> {
        if size % self.world_size != 0 {
            return None;
        }
        let len = size / self.world_size;
        Some((self.rank * len, len))
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self::single()
    }
}
