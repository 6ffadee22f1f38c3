//! Device communicator for collective operations.
//!
//! Only the primitives the sharded forward path needs are exposed:
//! an all-reduce for the two per-layer partial-sum combines and a barrier
//! for the load/repack rendezvous.

use candle_core::Tensor;

use super::error::Result;
use super::process_group::ShardSpec;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
}

/// Trait for rank-to-rank communication.
///
/// Every rank must enter the same collectives in the same order. Implementations
/// are free to block until all ranks have arrived.
pub trait DeviceCommunicator: Send + Sync {
    /// This rank's position in the group.
    fn shard_spec(&self) -> ShardSpec;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    ///
    /// For a single rank, this is identity.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;

    fn rank(&self) -> usize {
        self.shard_spec().rank()
    }

    fn world_size(&self) -> usize {
        self.shard_spec().world_size()
    }
}

/// Communicator for single-rank execution.
///
/// All collective operations are identity/no-ops since there's only one rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommunicator;

impl LocalCommunicator {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceCommunicator for LocalCommunicator {
    fn shard_spec(&self) -> ShardSpec {
        ShardSpec::single()
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
