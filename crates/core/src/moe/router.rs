//! DBRX router.
//!
//! Routes tokens to experts: softmax over expert logits in f32, top-k
//! selection, then optional p-norm normalization of the selected weights.
//! The router weight is replicated on every rank, so every rank computes the
//! same assignment.

use candle_core::{DType, Result, Tensor, D};

use crate::config::DbrxConfig;
use crate::distributed::{load_replicated, ShardingError, WeightSource};

/// Per-token routing decision.
#[derive(Debug, Clone)]
pub struct ExpertAssignment {
    /// Full routing distribution `[tokens, num_experts]`.
    pub weights: Tensor,
    /// Selected weights `[tokens, k]`, in the activation dtype.
    pub top_weights: Tensor,
    /// Selected global expert ids `[tokens, k]` (u32).
    pub top_experts: Tensor,
}

impl ExpertAssignment {
    /// Build an assignment directly, e.g. to force a routing in tests.
    pub fn from_top_k(top_weights: Tensor, top_experts: Tensor, num_experts: usize) -> Result<Self> {
        let (tokens, _) = top_weights.dims2()?;
        let weights = Tensor::zeros((tokens, num_experts), top_weights.dtype(), top_weights.device())?;
        Ok(Self {
            weights,
            top_weights,
            top_experts,
        })
    }

    pub fn top_k(&self) -> usize {
        self.top_experts.dims().last().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct DbrxRouter {
    /// `[num_experts, hidden]`
    weight: Tensor,
    top_k: usize,
    /// p of the p-norm applied to the top-k weights.
    normalize_p: Option<f64>,
}

impl DbrxRouter {
    /// Load `{prefix}.layer.weight`.
    pub fn load(cfg: &DbrxConfig, prefix: &str, source: &mut dyn WeightSource) -> std::result::Result<Self, ShardingError> {
        let weight = load_replicated(
            source,
            &format!("{prefix}.layer.weight"),
            &[cfg.num_experts(), cfg.d_model],
        )?;
        Ok(Self::new(weight, cfg.top_k(), cfg.ffn_config.moe_normalize_expert_weights))
    }

    pub fn new(weight: Tensor, top_k: usize, normalize_p: Option<f64>) -> Self {
        Self {
            weight,
            top_k,
            normalize_p,
        }
    }

    pub fn num_experts(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Route `hidden_states` `[tokens, hidden]`.
    pub fn route(&self, hidden_states: &Tensor) -> Result<ExpertAssignment> {
        let dtype = hidden_states.dtype();
        let logits = hidden_states.matmul(&self.weight.t()?)?;
        let weights = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;

        let (top_weights, top_experts) = top_k_with_indices(&weights, self.top_k)?;
        let top_weights = match self.normalize_p {
            Some(p) => {
                let norm = top_weights
                    .abs()?
                    .powf(p)?
                    .sum_keepdim(D::Minus1)?
                    .powf(1.0 / p)?;
                top_weights.broadcast_div(&norm)?
            }
            None => top_weights,
        };

        Ok(ExpertAssignment {
            weights: weights.to_dtype(dtype)?,
            top_weights: top_weights.to_dtype(dtype)?,
            top_experts,
        })
    }
}

/// Get top-k values and their indices from the last dimension.
///
/// Returns `(values [..., k], indices [..., k])`, sorted descending.
fn top_k_with_indices(tensor: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let dim = tensor.rank() - 1;

    // Sort in descending order, keep the first k
    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_k_indices = sorted_indices.narrow(dim, 0, k)?.contiguous()?;

    let top_k_values = tensor.contiguous()?.gather(&top_k_indices, dim)?;
    Ok((top_k_values, top_k_indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn router(normalize_p: Option<f64>) -> DbrxRouter {
        // 3 experts over hidden 2: logits = [x0, x1, x0 + x1]
        let w = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        DbrxRouter::new(w, 2, normalize_p)
    }

    #[test]
    fn test_picks_highest_probabilities() {
        let x = Tensor::new(&[[2f32, 0.0], [0.0, -3.0]], &Device::Cpu).unwrap();
        let a = router(None).route(&x).unwrap();

        let experts: Vec<Vec<u32>> = a.top_experts.to_vec2().unwrap();
        // token 0 logits [2, 0, 2]: experts 0 and 2 (tie, any order)
        let mut t0 = experts[0].clone();
        t0.sort_unstable();
        assert_eq!(t0, vec![0, 2]);
        // token 1 logits [0, -3, -3]: expert 0 first
        assert_eq!(experts[1][0], 0);

        let row_sums: Vec<f32> = a.weights.sum(1).unwrap().to_vec1().unwrap();
        for s in row_sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
        assert_eq!(a.top_k(), 2);
    }

    #[test]
    fn test_l1_normalization_makes_top_k_sum_to_one() {
        let x = Tensor::new(&[[0.3f32, -1.2], [1.5, 0.5]], &Device::Cpu).unwrap();
        let a = router(Some(1.0)).route(&x).unwrap();
        let sums: Vec<f32> = a.top_weights.sum(1).unwrap().to_vec1().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_without_normalization_weights_are_softmax_probs() {
        let x = Tensor::new(&[[0.3f32, -1.2]], &Device::Cpu).unwrap();
        let a = router(None).route(&x).unwrap();
        let top: Vec<Vec<f32>> = a.top_weights.to_vec2().unwrap();
        let all: Vec<Vec<f32>> = a.weights.to_vec2().unwrap();
        let mut sorted = all[0].clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        assert!((top[0][0] - sorted[0]).abs() < 1e-7);
        assert!((top[0][1] - sorted[1]).abs() < 1e-7);
    }

    #[test]
    fn test_activation_dtype_preserved() {
        let x = Tensor::new(&[[0.3f32, -1.2]], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F64)
            .unwrap();
        let w = Tensor::new(&[[1f64, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let a = DbrxRouter::new(w, 1, Some(2.0)).route(&x).unwrap();
        assert_eq!(a.top_weights.dtype(), DType::F64);
        assert_eq!(a.top_experts.dtype(), DType::U32);
    }
}
