//! Parallel linear layers for tensor parallelism.
//!
//! # Column Parallel Linear
//! Splits the output dimension: each rank computes a portion of the output.
//! Used for: the fused QKV projection (sectioned, so every rank keeps
//! `[q_r | k_r | v_r]`).
//!
//! # Row Parallel Linear
//! Splits the input dimension: each rank computes a partial sum of the full
//! output. Used for: the attention output projection.
//!
//! Neither layer communicates. The partial sums of a row-parallel layer are
//! combined by the owning block's [`OutputReduction`](super::OutputReduction),
//! so that every block performs exactly one reduction per forward.

use candle_core::{Module, Tensor};

use super::error::ShardingError;
use super::process_group::ShardSpec;
use super::shard::{load_shard, AxisPolicy};
use super::weight_source::WeightSource;

/// `x @ w.T (+ b)` over the last dim of an N-D input.
fn linear_forward(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> candle_core::Result<Tensor> {
    let input_dims = input.dims();
    let in_features = input.dim(candle_core::D::Minus1)?;
    let batch_size: usize = input_dims[..input_dims.len() - 1].iter().product();
    let out_features = weight.dim(0)?;

    // Flatten: [..., in_features] -> [batch, in_features]
    let input_2d = input.reshape((batch_size, in_features))?;
    let output_2d = input_2d.matmul(&weight.t()?)?;
    let output_2d = match bias {
        Some(b) => output_2d.broadcast_add(b)?,
        None => output_2d,
    };

    let mut out_dims = input_dims[..input_dims.len() - 1].to_vec();
    out_dims.push(out_features);
    output_2d.reshape(out_dims)
}

/// Column-parallel linear layer.
///
/// Weight: `[sum(sections)/world_size, in_features]`.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl ColumnParallelLinear {
    /// Load `{prefix}.weight` (and `{prefix}.bias`) and keep this rank's rows.
    ///
    /// `sections` lists the output widths that must be split independently;
    /// pass a single section for a plain column split.
    pub fn load(
        source: &mut dyn WeightSource,
        prefix: &str,
        in_features: usize,
        sections: &[usize],
        bias: bool,
        spec: ShardSpec,
    ) -> Result<Self, ShardingError> {
        let out_features: usize = sections.iter().sum();
        let policy = AxisPolicy::sectioned_column(sections.to_vec());

        let weight = load_shard(
            source,
            &format!("{prefix}.weight"),
            &[out_features, in_features],
            spec,
            &policy,
        )?;
        let bias = if bias {
            Some(load_shard(
                source,
                &format!("{prefix}.bias"),
                &[out_features],
                spec,
                &policy,
            )?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    /// Create from already-sharded tensors.
    pub fn from_parts(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn local_out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Module for ColumnParallelLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        linear_forward(xs, &self.weight, self.bias.as_ref())
    }
}

/// Row-parallel linear layer.
///
/// Weight: `[out_features, in_features/world_size]`. The bias is kept whole
/// and only rank 0 adds it, so the cross-rank sum contains it exactly once.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl RowParallelLinear {
    pub fn load(
        source: &mut dyn WeightSource,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        spec: ShardSpec,
    ) -> Result<Self, ShardingError> {
        let weight = load_shard(
            source,
            &format!("{prefix}.weight"),
            &[out_features, in_features],
            spec,
            &AxisPolicy::row_wise(),
        )?;
        let bias = if bias {
            let name = format!("{prefix}.bias");
            let b = source.pop_with_shape(&name, &[out_features])?;
            spec.is_coordinator().then_some(b)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn from_parts(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for RowParallelLinear {
    /// Partial output of this rank; must be summed across ranks.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        linear_forward(xs, &self.weight, self.bias.as_ref())
    }
}
