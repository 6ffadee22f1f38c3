//! Append new keys and values into the paged cache.

use candle_core::Tensor;

use super::error::{KernelError, KernelResultExt};
use crate::batch::BatchContext;

const KERNEL: &str = "fill_kv_cache";

/// Physical slot of every new token, in batch order.
///
/// Token `j` of sequence `i` sits at logical position `history_i + j`; its
/// slot is `block_offsets[i][pos / block_size] * block_size + pos % block_size`.
pub fn slot_mapping(ctx: &BatchContext, block_size: usize) -> Result<Vec<u32>, KernelError> {
    let mut slots = Vec::with_capacity(ctx.total_tokens());
    for (seq, blocks) in ctx.block_offsets().iter().enumerate() {
        let history = ctx.history_len(seq);
        for pos in history..history + ctx.q_seq_length()[seq] {
            let block = blocks.get(pos / block_size).ok_or_else(|| {
                KernelError::invalid(
                    KERNEL,
                    format!("sequence {seq}: no block for position {pos}"),
                )
            })?;
            slots.push(block * block_size as u32 + (pos % block_size) as u32);
        }
    }
    Ok(slots)
}

/// Write `key`/`value` (`[tokens, kv_heads, head_dim]`) into the cache slots
/// named by `ctx`. The cache tensors are updated in place.
pub fn fill_kv_cache(
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    ctx: &BatchContext,
) -> Result<(), KernelError> {
    let (num_blocks, block_size, num_kv_heads, head_dim) = key_cache.dims4().in_kernel(KERNEL)?;
    let slots = slot_mapping(ctx, block_size)?;
    if let Some(&bad) = slots.iter().find(|&&s| s as usize >= num_blocks * block_size) {
        return Err(KernelError::invalid(
            KERNEL,
            format!("slot {bad} out of range for {num_blocks} blocks"),
        ));
    }
    scatter(key, value, key_cache, value_cache, &slots, (num_blocks * block_size, num_kv_heads, head_dim))
        .in_kernel(KERNEL)
}

fn scatter(
    key: &Tensor,
    value: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    slots: &[u32],
    flat_shape: (usize, usize, usize),
) -> candle_core::Result<()> {
    let new_tokens = slots.len();
    let (_, num_kv_heads, head_dim) = flat_shape;

    // [num_blocks, block_size, kv_heads, head_dim] → [total_slots, kv_heads, head_dim]
    // reshape of the contiguous cache is a view (no copy), so scatter_set
    // writes through to the cache storage.
    let k_flat = key_cache.reshape(flat_shape)?;
    let v_flat = value_cache.reshape(flat_shape)?;

    let indices = Tensor::from_slice(slots, (new_tokens,), key_cache.device())?
        .reshape((new_tokens, 1, 1))?
        .expand((new_tokens, num_kv_heads, head_dim))?
        .contiguous()?;

    let k_src = key.to_dtype(key_cache.dtype())?.contiguous()?;
    let v_src = value.to_dtype(value_cache.dtype())?.contiguous()?;
    k_flat.scatter_set(&indices, &k_src, 0)?;
    v_flat.scatter_set(&indices, &v_src, 0)?;
    Ok(())
}
