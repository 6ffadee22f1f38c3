//! Kernel contracts used by the DBRX blocks, with reference CPU implementations.
//!
//! Every kernel takes the batch metadata it needs from a [`BatchContext`]
//! (`q_start_loc`, `q_seq_length`, `kv_seq_length`, `max_q_seq_length`,
//! `block_offsets`) and reports failures as [`KernelError`].
//!
//! [`BatchContext`]: crate::batch::BatchContext

mod error;
mod fill_kv_cache;
mod fused_moe;
mod paged_attention;
mod rotary;

pub use error::KernelError;
pub use fill_kv_cache::{fill_kv_cache, slot_mapping};
pub use fused_moe::fused_moe;
pub use paged_attention::paged_attention_fwd;
pub use rotary::fused_rotary_emb;
