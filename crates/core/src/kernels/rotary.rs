//! Fused rotary embedding over variable-length batched tokens.

use candle_core::{DType, Tensor};

use super::error::{KernelError, KernelResultExt};

const KERNEL: &str = "fused_rotary_emb";

/// Rotate Q and K by per-token positions (rotate-half convention).
///
/// - `query`: `[tokens, heads, head_dim]`
/// - `key`: `[tokens, kv_heads, head_dim]`
/// - `position_ids`: `[tokens]` (u32)
/// - `inv_freq`: `[head_dim / 2]` (f32)
///
/// Positions are divided by `scaling_factor` before the angles are computed.
pub fn fused_rotary_emb(
    query: &Tensor,
    key: &Tensor,
    position_ids: &Tensor,
    inv_freq: &Tensor,
    scaling_factor: f64,
) -> Result<(Tensor, Tensor), KernelError> {
    rotary_impl(query, key, position_ids, inv_freq, scaling_factor).in_kernel(KERNEL)
}

fn rotary_impl(
    query: &Tensor,
    key: &Tensor,
    position_ids: &Tensor,
    inv_freq: &Tensor,
    scaling_factor: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    let dtype = query.dtype();
    let positions = (position_ids.to_dtype(DType::F32)? / scaling_factor)?;

    // freqs: [tokens, head_dim/2]
    let freqs = positions
        .unsqueeze(1)?
        .matmul(&inv_freq.to_dtype(DType::F32)?.unsqueeze(0)?)?;
    let cos = freqs.cos()?.to_dtype(dtype)?;
    let sin = freqs.sin()?.to_dtype(dtype)?;

    // rope expects 4D input [b, h, t, d]
    // [tokens, heads, head_dim] → [1, heads, tokens, head_dim]
    let q = query.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
    let k = key.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;

    let q = candle_nn::rotary_emb::rope(&q, &cos, &sin)?;
    let k = candle_nn::rotary_emb::rope(&k, &cos, &sin)?;

    // Back to [tokens, heads, head_dim]
    let q = q.squeeze(0)?.transpose(0, 1)?.contiguous()?;
    let k = k.squeeze(0)?.transpose(0, 1)?.contiguous()?;
    Ok((q, k))
}
