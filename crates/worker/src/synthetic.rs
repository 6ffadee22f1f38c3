//! Stand-ins for a real checkpoint and scheduler.
//!
//! Lets the worker run without downloaded weights: a small DBRX config,
//! seeded random weights under the HuggingFace names, and a prefill batch
//! that hands each sequence fresh blocks.

use candle_core::{Device, Tensor};
use dbrx_tp_core::config::{AttnConfig, FfnConfig};
use dbrx_tp_core::distributed::TensorMap;
use dbrx_tp_core::{DbrxConfig, SequenceSlice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Config used when neither `--config` nor `--weights` is given.
pub fn demo_config() -> DbrxConfig {
    DbrxConfig {
        d_model: 64,
        n_heads: 8,
        n_layers: 2,
        max_seq_len: 2048,
        vocab_size: 256,
        attn_config: AttnConfig {
            clip_qkv: Some(8.0),
            kv_n_heads: 4,
            rope_theta: 500_000.0,
        },
        ffn_config: FfnConfig {
            ffn_hidden_size: 32,
            moe_num_experts: 8,
            moe_top_k: 2,
            moe_normalize_expert_weights: Some(1.0),
        },
        layer_norm_epsilon: 1e-5,
    }
}

/// How one synthetic tensor is drawn: `center ± scale`, uniform.
struct WeightSpec {
    name: String,
    shape: Vec<usize>,
    center: f32,
    scale: f32,
}

fn weight_specs(cfg: &DbrxConfig) -> Vec<WeightSpec> {
    let (d, e, f) = (cfg.d_model, cfg.num_experts(), cfg.ffn_hidden_size());
    let q = cfg.n_heads * cfg.head_dim();
    let kv = cfg.num_kv_heads() * cfg.head_dim();
    let proj = 1.0 / (d as f32).sqrt();

    let spec = |name: String, shape: Vec<usize>, center, scale| WeightSpec {
        name,
        shape,
        center,
        scale,
    };
    let norm = |name: String| spec(name, vec![d], 1.0, 0.1);

    let mut specs = vec![spec("transformer.wte.weight".into(), vec![cfg.vocab_size, d], 0.0, 1.0)];
    for layer in 0..cfg.n_layers {
        let block = format!("transformer.blocks.{layer}");
        let attn = format!("{block}.norm_attn_norm");
        specs.push(norm(format!("{attn}.norm_1.weight")));
        specs.push(spec(format!("{attn}.attn.Wqkv.weight"), vec![q + 2 * kv, d], 0.0, proj));
        specs.push(spec(format!("{attn}.attn.out_proj.weight"), vec![d, q], 0.0, proj));
        specs.push(norm(format!("{attn}.norm_2.weight")));
        specs.push(spec(format!("{block}.ffn.router.layer.weight"), vec![e, d], 0.0, proj));
        for w in ["w1", "v1", "w2"] {
            specs.push(spec(format!("{block}.ffn.experts.mlp.{w}"), vec![e * f, d], 0.0, proj));
        }
    }
    specs.push(norm("transformer.norm_f.weight".into()));
    specs
}

/// Full (unsharded) random weights. Every rank draws the same tensors from
/// the same `seed`, then keeps its own shard on load.
pub fn random_weights(cfg: &DbrxConfig, seed: u64, device: &Device) -> candle_core::Result<TensorMap> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut weights = TensorMap::new();
    for s in weight_specs(cfg) {
        let n: usize = s.shape.iter().product();
        let data: Vec<f32> = (0..n)
            .map(|_| s.center + rng.gen_range(-s.scale..s.scale))
            .collect();
        weights.insert(s.name, Tensor::from_vec(data, s.shape, device)?);
    }
    Ok(weights)
}

/// One fresh prefill per length; blocks are handed out in order, without gaps.
pub fn prefill_batch(seq_lens: &[usize], block_size: usize) -> Vec<SequenceSlice> {
    let mut next_block = 0u32;
    seq_lens
        .iter()
        .map(|&len| {
            let n = len.div_ceil(block_size) as u32;
            let blocks = (next_block..next_block + n).collect();
            next_block += n;
            SequenceSlice::prefill(len, blocks)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_config_shards_over_four_ranks() {
        let cfg = demo_config();
        cfg.validate().unwrap();
        cfg.validate_tensor_parallel(4).unwrap();
        assert_eq!(cfg.num_experts() % 4, 0);
    }

    #[test]
    fn test_random_weights_are_seeded() {
        let cfg = demo_config();
        let a = random_weights(&cfg, 9, &Device::Cpu).unwrap();
        let b = random_weights(&cfg, 9, &Device::Cpu).unwrap();
        assert_eq!(a.len(), 2 + 8 * cfg.n_layers);

        let name = "transformer.blocks.1.ffn.experts.mlp.v1";
        let (a, b) = (a.get(name).unwrap(), b.get(name).unwrap());
        assert_eq!(a.dims(), &[cfg.num_experts() * cfg.ffn_hidden_size(), cfg.d_model]);
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_prefill_batch_blocks_are_disjoint() {
        let batch = prefill_batch(&[5, 3, 9], 4);
        assert_eq!(batch[0].block_ids, vec![0, 1]);
        assert_eq!(batch[1].block_ids, vec![2]);
        assert_eq!(batch[2].block_ids, vec![3, 4, 5]);
        assert!(batch.iter().all(|s| s.history_len == 0));
    }
}
