use candle_core::{DType, Device};

use crate::config::{AttnConfig, DbrxConfig, FfnConfig};
use crate::kv_cache::CacheConfig;

/// A DBRX config small enough for CPU tests (2 layers, 32 hidden, 4 experts).
///
/// Shardable over one or two ranks.
pub fn tiny_dbrx_config() -> DbrxConfig {
    DbrxConfig {
        d_model: 32,
        n_heads: 4,
        n_layers: 2,
        max_seq_len: 128,
        vocab_size: 64,
        attn_config: AttnConfig {
            clip_qkv: Some(8.0),
            kv_n_heads: 2,
            rope_theta: 10_000.0,
        },
        ffn_config: FfnConfig {
            ffn_hidden_size: 16,
            moe_num_experts: 4,
            moe_top_k: 2,
            moe_normalize_expert_weights: Some(1.0),
        },
        layer_norm_epsilon: 1e-5,
    }
}

/// Per-rank cache for [`tiny_dbrx_config`]-shaped models: 4-token blocks,
/// 32 blocks, KV heads divided by `world_size`.
pub fn tiny_cache_config(cfg: &DbrxConfig, world_size: usize) -> CacheConfig {
    CacheConfig {
        block_size: 4,
        num_blocks: 32,
        num_layers: cfg.n_layers,
        num_kv_heads: cfg.num_kv_heads() / world_size,
        head_dim: cfg.head_dim(),
        dtype: DType::F32,
        device: Device::Cpu,
    }
}
