//! DBRX attention, sharded by heads.
//!
//! - Fused QKV (`Wqkv`): column-parallel, split per Q/K/V section so every
//!   rank keeps whole heads of each
//! - Optional `clip_qkv` clamp on the QKV activations
//! - Rotary embedding at per-token absolute positions
//! - Paged KV cache append + paged attention (no mask)
//! - Output projection (`out_proj`): row-parallel, summed across ranks

use std::sync::Arc;

use candle_core::{Module, Tensor};
use tracing::debug;

use crate::batch::BatchContext;
use crate::config::DbrxConfig;
use crate::distributed::{
    ColumnParallelLinear, DeviceCommunicator, OutputReduction, RowParallelLinear, WeightSource,
};
use crate::kernels::{fill_kv_cache, paged_attention_fwd};
use crate::kv_cache::PagedKvCache;
use crate::layers::RotaryEmbedding;

#[derive(Debug)]
pub struct DbrxAttention {
    wqkv: ColumnParallelLinear,
    out_proj: RowParallelLinear,
    rotary_emb: RotaryEmbedding,
    clip_qkv: Option<f64>,
    /// Heads on this rank.
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    reduction: OutputReduction,
}

impl DbrxAttention {
    /// Load `{prefix}.Wqkv.weight` and `{prefix}.out_proj.weight`.
    pub fn load(
        cfg: &DbrxConfig,
        prefix: &str,
        source: &mut dyn WeightSource,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> crate::Result<Self> {
        let spec = comm.shard_spec();
        let world_size = spec.world_size();
        cfg.validate_tensor_parallel(world_size)?;

        let head_dim = cfg.head_dim();
        let q_size = cfg.n_heads * head_dim;
        let kv_size = cfg.num_kv_heads() * head_dim;

        let wqkv = ColumnParallelLinear::load(
            source,
            &format!("{prefix}.Wqkv"),
            cfg.d_model,
            &[q_size, kv_size, kv_size],
            false,
            spec,
        )?;
        let out_proj = RowParallelLinear::load(
            source,
            &format!("{prefix}.out_proj"),
            q_size,
            cfg.d_model,
            false,
            spec,
        )?;
        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            cfg.attn_config.rope_theta,
            1.0,
            wqkv.weight().device(),
        );

        Ok(Self {
            wqkv,
            out_proj,
            rotary_emb,
            clip_qkv: cfg.attn_config.clip_qkv,
            num_heads: cfg.n_heads / world_size,
            num_kv_heads: cfg.num_kv_heads() / world_size,
            head_dim,
            reduction: OutputReduction::for_communicator(comm),
        })
    }

    pub fn num_local_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_local_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn rotary_emb(&self) -> &RotaryEmbedding {
        &self.rotary_emb
    }

    /// `xs [tokens, hidden]` → `[tokens, hidden]`, summed across ranks.
    ///
    /// The batch context is validated against `xs` and the cache before
    /// anything is written.
    pub fn forward(
        &self,
        xs: &Tensor,
        ctx: &BatchContext,
        cache: &mut PagedKvCache,
    ) -> crate::Result<Tensor> {
        let num_tokens = xs.dim(0)?;
        ctx.check_tokens(num_tokens)?;
        ctx.check_capacity(cache.block_size(), cache.num_blocks())?;

        let qkv = self.wqkv.forward(xs)?;
        let qkv = match self.clip_qkv {
            Some(clip) => qkv.clamp(-clip, clip)?,
            None => qkv,
        };

        // Split fused QKV: Q has num_heads, K and V each have num_kv_heads
        let q_size = self.num_heads * self.head_dim;
        let kv_size = self.num_kv_heads * self.head_dim;
        let q = qkv
            .narrow(1, 0, q_size)?
            .reshape((num_tokens, self.num_heads, self.head_dim))?;
        let k = qkv
            .narrow(1, q_size, kv_size)?
            .reshape((num_tokens, self.num_kv_heads, self.head_dim))?;
        let v = qkv
            .narrow(1, q_size + kv_size, kv_size)?
            .reshape((num_tokens, self.num_kv_heads, self.head_dim))?;

        let positions = ctx.position_ids_tensor(xs.device())?;
        let (q, k) = self.rotary_emb.apply(&q, &k, &positions)?;

        let (key_cache, value_cache) = cache.tensors_mut();
        fill_kv_cache(&k, &v, key_cache, value_cache, ctx)?;
        let attn = paged_attention_fwd(&q, cache.key_cache(), cache.value_cache(), ctx)?;

        debug!(
            tokens = num_tokens,
            sequences = ctx.num_sequences(),
            max_q_len = ctx.max_q_seq_length(),
            "attention"
        );
        let attn = attn.reshape((num_tokens, q_size))?;
        let out = self.out_proj.forward(&attn)?;
        Ok(self.reduction.apply(out)?)
    }
}
