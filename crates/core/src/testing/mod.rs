//! Shared test utilities for dbrx-tp-core.
//!
//! Tiny DBRX configs, seeded random weights under the HuggingFace names,
//! batch builders and a collective-counting communicator.

mod batch;
mod communicator;
mod tiny_config;
mod weights;

pub use batch::{block_ids, prefill_slices};
pub use communicator::CountingCommunicator;
pub use tiny_config::{tiny_cache_config, tiny_dbrx_config};
pub use weights::{max_abs_diff, random_dbrx_weights};
