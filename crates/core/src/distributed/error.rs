//! Error types for distributed operations and weight sharding.

use thiserror::Error;

/// Errors that can occur during collective operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A process group needs at least one member.
    #[error("world_size must be >= 1")]
    InvalidWorldSize,

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Ranks entered different collectives (or the same one out of order).
    #[error("collective desync: rank {rank} is at call {local_seq}, rank {other_rank} at call {other_seq}")]
    CollectiveDesync {
        rank: usize,
        local_seq: u64,
        other_rank: usize,
        other_seq: u64,
    },

    /// Shared group state was poisoned by a panicking rank.
    #[error("process group state poisoned")]
    Poisoned,

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

/// Load-time shape and divisibility violations.
///
/// These are always fatal: a rank never installs a partial or degraded shard.
#[derive(Error, Debug)]
pub enum ShardingError {
    #[error("{name}: dim {dim} of size {size} is not divisible by world_size {world_size}")]
    NotDivisible {
        name: String,
        dim: usize,
        size: usize,
        world_size: usize,
    },

    #[error("{name}: section {section} of size {size} is not divisible by world_size {world_size}")]
    SectionNotDivisible {
        name: String,
        section: usize,
        size: usize,
        world_size: usize,
    },

    #[error("{name}: sections {sections:?} do not cover dim {dim} of size {size}")]
    SectionsMismatch {
        name: String,
        dim: usize,
        size: usize,
        sections: Vec<usize>,
    },

    #[error("{name}: dim {dim} out of range for rank-{rank} tensor")]
    DimOutOfRange {
        name: String,
        dim: usize,
        rank: usize,
    },

    #[error("weight {0} not found in weight source")]
    MissingWeight(String),

    #[error("{name}: expected shape {expected:?}, found {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor error while sharding: {0}")]
    Tensor(#[from] candle_core::Error),
}
