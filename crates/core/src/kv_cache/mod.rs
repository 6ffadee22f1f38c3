//! Paged KV cache storage.
//!
//! Block ids are handed out by the caller; this module only owns the
//! per-layer key/value tensors they address.

mod cache_engine;
pub mod config;
mod error;

pub use cache_engine::{KvCaches, PagedKvCache};
pub use config::CacheConfig;
pub use error::CacheError;
