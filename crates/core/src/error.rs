//! Crate-level error aggregating every concern's error type.

use thiserror::Error;

use crate::batch::BatchContextError;
use crate::config::ConfigError;
use crate::distributed::{DistributedError, ShardingError};
use crate::kernels::KernelError;
use crate::kv_cache::CacheError;
use crate::moe::MoeError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("malformed batch context: {0}")]
    BatchContext(#[from] BatchContextError),

    #[error(transparent)]
    Moe(#[from] MoeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
