use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DbrxConfig;
use crate::distributed::TensorMap;

fn uniform(rng: &mut StdRng, shape: &[usize], center: f32, scale: f32, device: &Device) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| center + rng.gen_range(-scale..scale)).collect();
    Tensor::from_vec(data, shape, device)
}

/// Seeded random f32 weights for every tensor a [`crate::DbrxModel`] loads,
/// under their HuggingFace names.
///
/// Scales keep activations O(1) through a couple of layers.
pub fn random_dbrx_weights(cfg: &DbrxConfig, seed: u64, device: &Device) -> Result<TensorMap> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut weights = TensorMap::new();

    let (d, e, f) = (cfg.d_model, cfg.num_experts(), cfg.ffn_hidden_size());
    let q = cfg.n_heads * cfg.head_dim();
    let kv = cfg.num_kv_heads() * cfg.head_dim();
    let proj = 1.0 / (d as f32).sqrt();

    weights.insert("transformer.wte.weight", uniform(&mut rng, &[cfg.vocab_size, d], 0.0, 1.0, device)?);
    for layer in 0..cfg.n_layers {
        let p = format!("transformer.blocks.{layer}");
        weights.insert(
            format!("{p}.norm_attn_norm.norm_1.weight"),
            uniform(&mut rng, &[d], 1.0, 0.1, device)?,
        );
        weights.insert(
            format!("{p}.norm_attn_norm.attn.Wqkv.weight"),
            uniform(&mut rng, &[q + 2 * kv, d], 0.0, proj, device)?,
        );
        weights.insert(
            format!("{p}.norm_attn_norm.attn.out_proj.weight"),
            uniform(&mut rng, &[d, q], 0.0, proj, device)?,
        );
        weights.insert(
            format!("{p}.norm_attn_norm.norm_2.weight"),
            uniform(&mut rng, &[d], 1.0, 0.1, device)?,
        );
        weights.insert(
            format!("{p}.ffn.router.layer.weight"),
            uniform(&mut rng, &[e, d], 0.0, proj, device)?,
        );
        for name in ["w1", "v1", "w2"] {
            weights.insert(
                format!("{p}.ffn.experts.mlp.{name}"),
                uniform(&mut rng, &[e * f, d], 0.0, proj, device)?,
            );
        }
    }
    weights.insert("transformer.norm_f.weight", uniform(&mut rng, &[d], 1.0, 0.1, device)?);
    Ok(weights)
}

/// Largest element-wise absolute difference, in f32.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_dtype(candle_core::DType::F32)?.to_scalar()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_dbrx_config;

    #[test]
    fn test_same_seed_same_weights() {
        let cfg = tiny_dbrx_config();
        let a = random_dbrx_weights(&cfg, 5, &Device::Cpu).unwrap();
        let b = random_dbrx_weights(&cfg, 5, &Device::Cpu).unwrap();
        assert_eq!(a.names(), b.names());
        let name = "transformer.blocks.1.ffn.experts.mlp.w2";
        let diff = max_abs_diff(a.get(name).unwrap(), b.get(name).unwrap()).unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_covers_every_layer() {
        let cfg = tiny_dbrx_config();
        let w = random_dbrx_weights(&cfg, 0, &Device::Cpu).unwrap();
        // wte + norm_f + 8 per layer
        assert_eq!(w.len(), 2 + 8 * cfg.n_layers);
        assert_eq!(
            w.get("transformer.blocks.0.norm_attn_norm.attn.Wqkv.weight").unwrap().dims(),
            &[64, 32]
        );
    }
}
