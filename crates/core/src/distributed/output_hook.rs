//! Block output reduction.
//!
//! A block whose output is a partial sum owns one [`OutputReduction`], chosen
//! at construction from the communicator's [`ShardSpec`](super::ShardSpec).
//! Every rank of a group sees the same shard layout, so either every rank
//! reduces or none does.

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::Result;

#[derive(Clone)]
pub enum OutputReduction {
    /// Single rank: the local output is already the full output.
    Identity,
    /// Sum across ranks, entered on every call regardless of the input.
    AllReduce(Arc<dyn DeviceCommunicator>),
}

impl OutputReduction {
    pub fn for_communicator(comm: Arc<dyn DeviceCommunicator>) -> Self {
        if comm.shard_spec().is_single() {
            Self::Identity
        } else {
            Self::AllReduce(comm)
        }
    }

    pub fn apply(&self, partial: Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(partial),
            Self::AllReduce(comm) => comm.all_reduce(&partial, ReduceOp::Sum),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

impl fmt::Debug for OutputReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("Identity"),
            Self::AllReduce(comm) => f
                .debug_struct("AllReduce")
                .field("rank", &comm.rank())
                .field("world_size", &comm.world_size())
                .finish(),
        }
    }
}
