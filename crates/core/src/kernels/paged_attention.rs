//! Paged attention over variable-length batched queries.
//!
//! Each sequence's queries attend to that sequence's cached keys only, read
//! through its block table. Causality inside a sequence is enforced here: a
//! query at logical position `p` sees keys `0..=p`. Callers never pass a mask.

use candle_core::{DType, Tensor};

use super::error::{KernelError, KernelResultExt};
use crate::batch::BatchContext;

const KERNEL: &str = "paged_attention_fwd";

/// Attention for every query token of the batch.
///
/// - `query`: `[tokens, heads, head_dim]`, already rotated
/// - `key_cache` / `value_cache`: `[num_blocks, block_size, kv_heads, head_dim]`,
///   already holding this step's keys and values
///
/// Returns `[tokens, heads, head_dim]`.
pub fn paged_attention_fwd(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    ctx: &BatchContext,
) -> Result<Tensor, KernelError> {
    let (num_tokens, num_heads, head_dim) = query.dims3().in_kernel(KERNEL)?;
    let (_, _, num_kv_heads, _) = key_cache.dims4().in_kernel(KERNEL)?;
    if num_tokens != ctx.total_tokens() {
        return Err(KernelError::invalid(
            KERNEL,
            format!("query has {num_tokens} tokens, batch has {}", ctx.total_tokens()),
        ));
    }
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(KernelError::invalid(
            KERNEL,
            format!("{num_heads} query heads cannot share {num_kv_heads} kv heads"),
        ));
    }
    let scale = 1.0 / (head_dim as f64).sqrt();

    let mut outputs = Vec::with_capacity(ctx.num_sequences());
    for seq in 0..ctx.num_sequences() {
        let out = attend_sequence(query, key_cache, value_cache, ctx, seq, scale).in_kernel(KERNEL)?;
        outputs.push(out);
    }
    Tensor::cat(&outputs, 0).in_kernel(KERNEL)
}

fn attend_sequence(
    query: &Tensor,
    key_cache: &Tensor,
    value_cache: &Tensor,
    ctx: &BatchContext,
    seq: usize,
    scale: f64,
) -> candle_core::Result<Tensor> {
    let (_, block_size, num_kv_heads, head_dim) = key_cache.dims4()?;
    let num_heads = query.dim(1)?;
    let n_rep = num_heads / num_kv_heads;
    let dtype = query.dtype();

    let q_start = ctx.q_start_loc()[seq];
    let q_len = ctx.q_seq_length()[seq];
    let kv_len = ctx.kv_seq_length()[seq];
    let history = ctx.history_len(seq);
    let blocks = &ctx.block_offsets()[seq];

    // Gather the sequence's blocks: [n_blocks * block_size, kv_heads, head_dim]
    let block_ids = Tensor::from_slice(blocks.as_slice(), blocks.len(), key_cache.device())?;
    let flat = (blocks.len() * block_size, num_kv_heads, head_dim);
    let k = key_cache.index_select(&block_ids, 0)?.reshape(flat)?.narrow(0, 0, kv_len)?;
    let v = value_cache.index_select(&block_ids, 0)?.reshape(flat)?.narrow(0, 0, kv_len)?;

    // Grouped-query attention: [kv_len, kv_heads, d] → [heads, kv_len, d]
    let repeat_kv = |t: Tensor| -> candle_core::Result<Tensor> {
        let t = t.transpose(0, 1)?;
        if n_rep == 1 {
            return t.contiguous();
        }
        t.unsqueeze(1)?
            .expand((num_kv_heads, n_rep, kv_len, head_dim))?
            .reshape((num_heads, kv_len, head_dim))
    };
    let k = repeat_kv(k)?.to_dtype(DType::F32)?;
    let v = repeat_kv(v)?.to_dtype(DType::F32)?;

    // [q_len, heads, d] → [heads, q_len, d]
    let q = query
        .narrow(0, q_start, q_len)?
        .transpose(0, 1)?
        .contiguous()?
        .to_dtype(DType::F32)?;

    let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

    // Query i sits at position history + i and may see keys 0..=history + i.
    let bias: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| if j <= history + i { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    let bias = Tensor::from_vec(bias, (1, q_len, kv_len), query.device())?;
    let probs = candle_nn::ops::softmax_last_dim(&scores.broadcast_add(&bias)?)?;

    // [heads, q_len, d] → [q_len, heads, d]
    probs
        .matmul(&v)?
        .transpose(0, 1)?
        .contiguous()?
        .to_dtype(dtype)
}
