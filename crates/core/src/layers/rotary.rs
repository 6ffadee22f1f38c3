use candle_core::{DType, Device, Result, Tensor};
use once_cell::sync::OnceCell;

use crate::kernels::{fused_rotary_emb, KernelError};

/// Rotary position embedding with a lazily built inverse-frequency table.
///
/// The table depends only on `(base, dim)`; it is computed on the first call
/// and the same tensor is reused for every later call.
#[derive(Debug)]
pub struct RotaryEmbedding {
    dim: usize,
    base: f64,
    scaling_factor: f64,
    device: Device,
    inv_freq: OnceCell<Tensor>,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, base: f64, scaling_factor: f64, device: &Device) -> Self {
        Self {
            dim,
            base,
            scaling_factor,
            device: device.clone(),
            inv_freq: OnceCell::new(),
        }
    }

    /// `inv_freq[i] = 1 / base^(2i / dim)`, shape `[dim / 2]`, f32.
    pub fn inv_freq(&self) -> Result<&Tensor> {
        self.inv_freq.get_or_try_init(|| {
            let inv_freq: Vec<f32> = (0..self.dim)
                .step_by(2)
                .map(|i| 1.0 / (self.base as f32).powf(i as f32 / self.dim as f32))
                .collect();
            let len = inv_freq.len();
            Tensor::from_vec(inv_freq, len, &self.device)?.to_dtype(DType::F32)
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.inv_freq.get().is_some()
    }

    /// Rotate `q` `[tokens, heads, dim]` and `k` `[tokens, kv_heads, dim]`
    /// at the given per-token positions.
    pub fn apply(&self, q: &Tensor, k: &Tensor, position_ids: &Tensor) -> std::result::Result<(Tensor, Tensor), KernelError> {
        let inv_freq = self
            .inv_freq()
            .map_err(|e| KernelError::new("fused_rotary_emb", e))?;
        fused_rotary_emb(q, k, position_ids, inv_freq, self.scaling_factor)
    }
}
