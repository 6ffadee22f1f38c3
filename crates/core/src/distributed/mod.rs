//! Distributed computing abstractions for tensor parallelism.
//!
//! - [`ShardSpec`] - this rank's `(rank, world_size)`
//! - [`DeviceCommunicator`] - collective operations (all_reduce, barrier)
//! - [`shard_tensor`] / [`WeightSource`] - per-rank weight slicing at load time
//! - [`ColumnParallelLinear`] / [`RowParallelLinear`] - sharded projections
//! - [`OutputReduction`] - the per-block reduction chosen at construction
//!
//! # Architecture
//!
//! - Single rank: every reduction is identity (world_size=1 bypass)
//! - Multi rank: one thread per rank in lockstep, see [`InProcessGroup`]
//!
//! # Usage
//!
//! ```ignore
//! use dbrx_tp_core::distributed::{DeviceCommunicator, InProcessGroup};
//!
//! let comms = InProcessGroup::new(2)?;
//! assert_eq!(comms[1].shard_spec().rank(), 1);
//! ```

mod communicator;
mod error;
mod in_process;
mod output_hook;
mod parallel_layers;
mod process_group;
mod shard;
mod weight_source;

pub use communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
pub use error::{DistributedError, ShardingError};
pub use in_process::{InProcessCommunicator, InProcessGroup};
pub use output_hook::OutputReduction;
pub use parallel_layers::{ColumnParallelLinear, RowParallelLinear};
pub use process_group::ShardSpec;
pub use shard::{load_replicated, load_shard, shard_tensor, AxisPolicy, Split};
pub use weight_source::{TensorMap, WeightSource};
