//! Tensor-parallel DBRX forward path for paged, continuous-batched inference.
//!
//! Each rank loads its shard of the attention and expert weights, repacks
//! the experts once, then runs forward passes over concatenated sequences
//! that read and append to a paged KV cache. Partial outputs are summed
//! across ranks through a [`distributed::DeviceCommunicator`].

pub mod batch;
pub mod config;
pub mod distributed;
mod error;
pub mod kernels;
pub mod kv_cache;
pub mod layers;
pub mod models;
pub mod moe;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use batch::{BatchContext, BatchContextError, SequenceSlice};
pub use config::{ConfigError, DbrxConfig};
pub use error::{Error, Result};
pub use models::DbrxModel;
