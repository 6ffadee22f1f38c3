//! Weight shard loader.
//!
//! Checkpoints hold FULL (unsharded) tensors. Each rank pops the full tensor
//! from the weight source, keeps only its slice and lets the full tensor go:
//! - column-wise: slices the output dimension (dim 0 of a linear weight)
//! - row-wise: slices the input dimension (dim 1 of a linear weight)
//! - sectioned column-wise: slices every named section of dim 0 separately,
//!   so a fused QKV weight stays `[q_r | k_r | v_r]` on every rank
//! - any other dim: used for the 3-D expert tensors

use candle_core::Tensor;

use super::error::ShardingError;
use super::process_group::ShardSpec;
use super::weight_source::WeightSource;

/// How the chosen dimension is divided among ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Split {
    /// `world_size` equal contiguous groups.
    Even,
    /// Each section split evenly; rank `r` keeps slice `r` of every section.
    Sections(Vec<usize>),
}

/// Which dimension of a tensor is sharded, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisPolicy {
    pub dim: usize,
    pub split: Split,
}

impl AxisPolicy {
    /// Output-feature split for a `[out, in]` weight (also used for biases).
    pub fn column_wise() -> Self {
        Self::along(0)
    }

    /// Input-feature split for a `[out, in]` weight.
    pub fn row_wise() -> Self {
        Self::along(1)
    }

    /// Output-feature split performed per section, e.g. `[q, k, v]` widths.
    pub fn sectioned_column(sections: Vec<usize>) -> Self {
        Self {
            dim: 0,
            split: Split::Sections(sections),
        }
    }

    /// Even split along an arbitrary dimension.
    pub fn along(dim: usize) -> Self {
        Self {
            dim,
            split: Split::Even,
        }
    }
}

/// Slice `full` down to the part owned by `spec`.
///
/// The returned tensor owns fresh storage; `full` is consumed and dropped
/// here, so the unsharded bytes are released as soon as the caller holds no
/// other handle to them. With a single rank the tensor is returned as is.
pub fn shard_tensor(
    name: &str,
    full: Tensor,
    spec: ShardSpec,
    policy: &AxisPolicy,
) -> Result<Tensor, ShardingError> {
    let dim = policy.dim;
    let rank = full.rank();
    if dim >= rank {
        return Err(ShardingError::DimOutOfRange {
            name: name.to_string(),
            dim,
            rank,
        });
    }
    let size = full.dim(dim)?;
    let world_size = spec.world_size();

    let shard = match &policy.split {
        Split::Even => {
            let (start, len) = spec.even_range(size).ok_or_else(|| ShardingError::NotDivisible {
                name: name.to_string(),
                dim,
                size,
                world_size,
            })?;
            if spec.is_single() {
                return Ok(full);
            }
            full.narrow(dim, start, len)?.force_contiguous()?
        }
        Split::Sections(sections) => {
            let total: usize = sections.iter().sum();
            if total != size {
                return Err(ShardingError::SectionsMismatch {
                    name: name.to_string(),
                    dim,
                    size,
                    sections: sections.clone(),
                });
            }
            for (section, &s) in sections.iter().enumerate() {
                if s % world_size != 0 {
                    return Err(ShardingError::SectionNotDivisible {
                        name: name.to_string(),
                        section,
                        size: s,
                        world_size,
                    });
                }
            }
            if spec.is_single() {
                return Ok(full);
            }

            let mut pieces = Vec::with_capacity(sections.len());
            let mut offset = 0;
            for &s in sections {
                let len = s / world_size;
                pieces.push(full.narrow(dim, offset + spec.rank() * len, len)?);
                offset += s;
            }
            match pieces.len() {
                1 => pieces[0].force_contiguous()?,
                _ => Tensor::cat(&pieces, dim)?,
            }
        }
    };
    drop(full);
    Ok(shard)
}

/// Pop `name` from `source`, check its full shape and shard it.
pub fn load_shard(
    source: &mut dyn WeightSource,
    name: &str,
    full_shape: &[usize],
    spec: ShardSpec,
    policy: &AxisPolicy,
) -> Result<Tensor, ShardingError> {
    let full = source.pop_with_shape(name, full_shape)?;
    shard_tensor(name, full, spec, policy)
}

/// Pop `name` from `source` and keep it whole on every rank.
pub fn load_replicated(
    source: &mut dyn WeightSource,
    name: &str,
    full_shape: &[usize],
) -> Result<Tensor, ShardingError> {
    source.pop_with_shape(name, full_shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::weight_source::TensorMap;
    use candle_core::{DType, Device};

    fn arange_2d(rows: usize, cols: usize) -> Tensor {
        Tensor::arange(0f32, (rows * cols) as f32, &Device::Cpu)
            .unwrap()
            .reshape((rows, cols))
            .unwrap()
    }

    #[test]
    fn test_column_wise_even_split() {
        let full = arange_2d(8, 3);
        let spec = ShardSpec::new(1, 4).unwrap();
        let shard = shard_tensor("w", full.clone(), spec, &AxisPolicy::column_wise()).unwrap();

        assert_eq!(shard.dims(), &[2, 3]);
        let expected = full.narrow(0, 2, 2).unwrap();
        assert_eq!(
            shard.to_vec2::<f32>().unwrap(),
            expected.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_sectioned_shards_reassemble_per_section() {
        // q=8, k=4, v=4 rows; world_size 2
        let sections = vec![8, 4, 4];
        let full = arange_2d(16, 3);
        let policy = AxisPolicy::sectioned_column(sections.clone());

        let shards: Vec<Tensor> = (0..2)
            .map(|r| {
                let spec = ShardSpec::new(r, 2).unwrap();
                shard_tensor("wqkv", full.clone(), spec, &policy).unwrap()
            })
            .collect();

        // Each shard is [4 q | 2 k | 2 v] rows.
        for s in &shards {
            assert_eq!(s.dims(), &[8, 3]);
        }

        let mut full_offset = 0;
        let mut local_offset = 0;
        for &sec in &sections {
            let local = sec / 2;
            let parts: Vec<Tensor> = shards
                .iter()
                .map(|s| s.narrow(0, local_offset, local).unwrap())
                .collect();
            let rebuilt = Tensor::cat(&parts, 0).unwrap();
            let original = full.narrow(0, full_offset, sec).unwrap();
            assert_eq!(
                rebuilt.to_vec2::<f32>().unwrap(),
                original.to_vec2::<f32>().unwrap()
            );
            full_offset += sec;
            local_offset += local;
        }
    }

    #[test]
    fn test_row_wise_partial_products_sum_to_full() {
        let full = arange_2d(3, 8);
        let input = Tensor::arange(0f32, 16.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 8))
            .unwrap();
        let expected = input.matmul(&full.t().unwrap()).unwrap();

        let mut acc = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        for r in 0..4 {
            let spec = ShardSpec::new(r, 4).unwrap();
            let w = shard_tensor("w", full.clone(), spec, &AxisPolicy::row_wise()).unwrap();
            let x = input.narrow(1, r * 2, 2).unwrap();
            acc = acc.add(&x.matmul(&w.t().unwrap()).unwrap()).unwrap();
        }
        assert_eq!(
            acc.to_vec2::<f32>().unwrap(),
            expected.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_not_divisible_is_rejected() {
        let spec = ShardSpec::new(0, 4).unwrap();
        let err = shard_tensor("w", arange_2d(6, 2), spec, &AxisPolicy::column_wise()).unwrap_err();
        assert!(matches!(
            err,
            ShardingError::NotDivisible {
                dim: 0,
                size: 6,
                world_size: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_section_not_divisible_is_rejected() {
        let spec = ShardSpec::new(0, 2).unwrap();
        let policy = AxisPolicy::sectioned_column(vec![4, 3, 3]);
        let err = shard_tensor("w", arange_2d(10, 2), spec, &policy).unwrap_err();
        assert!(matches!(
            err,
            ShardingError::SectionNotDivisible { section: 1, .. }
        ));
    }

    #[test]
    fn test_sections_must_cover_axis() {
        let policy = AxisPolicy::sectioned_column(vec![4, 2]);
        let err = shard_tensor("w", arange_2d(8, 2), ShardSpec::single(), &policy).unwrap_err();
        assert!(matches!(err, ShardingError::SectionsMismatch { .. }));
    }

    #[test]
    fn test_dim_out_of_range() {
        let err = shard_tensor(
            "w",
            arange_2d(4, 4),
            ShardSpec::single(),
            &AxisPolicy::along(2),
        )
        .unwrap_err();
        assert!(matches!(err, ShardingError::DimOutOfRange { dim: 2, rank: 2, .. }));
    }

    #[test]
    fn test_single_rank_keeps_tensor_as_is() {
        let full = arange_2d(4, 4);
        let id = full.id();
        let out = shard_tensor("w", full, ShardSpec::single(), &AxisPolicy::row_wise()).unwrap();
        assert_eq!(out.id(), id);
    }

    #[test]
    fn test_load_shard_pops_from_source() {
        let mut source = TensorMap::new();
        source.insert("w", arange_2d(4, 2));
        let spec = ShardSpec::new(1, 2).unwrap();

        let shard = load_shard(&mut source, "w", &[4, 2], spec, &AxisPolicy::column_wise()).unwrap();
        assert_eq!(shard.dims(), &[2, 2]);
        assert!(!source.contains("w"));

        let err = load_shard(&mut source, "w", &[4, 2], spec, &AxisPolicy::column_wise()).unwrap_err();
        assert!(matches!(err, ShardingError::MissingWeight(_)));
    }

    #[test]
    fn test_load_shard_checks_full_shape() {
        let mut source = TensorMap::new();
        source.insert("w", arange_2d(4, 2));
        let err = load_replicated(&mut source, "w", &[2, 4]).unwrap_err();
        assert!(matches!(err, ShardingError::ShapeMismatch { .. }));
    }
}
