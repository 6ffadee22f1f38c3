//! Expert weight storage, sharding and the one-time repack into the fused layout.
//!
//! DBRX checkpoints store each expert projection as one `[experts * ffn, hidden]`
//! matrix (`w1` gate, `v1` value, `w2` down). They are viewed as
//! `[experts, ffn, hidden]` and sharded according to [`ExpertShardPolicy`]:
//!
//! - **ExpertAxis**: rank `r` owns experts `[r*n/ws .. (r+1)*n/ws)` whole.
//! - **FfnAxis**: every rank owns all experts, with a `1/ws` slice of each
//!   expert's intermediate dimension.
//!
//! Either way each rank's expert output is a partial sum of the full output.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};

use super::error::MoeError;
use crate::config::DbrxConfig;
use crate::distributed::{shard_tensor, AxisPolicy, ShardSpec, ShardingError, WeightSource};

/// Sentinel local id for experts owned by another rank.
pub const REMOTE_EXPERT: u32 = u32::MAX;

/// How expert weights are partitioned across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpertShardPolicy {
    /// Contiguous, disjoint expert subsets per rank.
    #[default]
    ExpertAxis,
    /// Every expert's ffn dimension split across ranks.
    FfnAxis,
}

impl ExpertShardPolicy {
    /// Dim of the `[experts, ffn, hidden]` view that is sharded.
    fn shard_dim(self) -> usize {
        match self {
            Self::ExpertAxis => 0,
            Self::FfnAxis => 1,
        }
    }
}

impl fmt::Display for ExpertShardPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpertAxis => f.write_str("expert"),
            Self::FfnAxis => f.write_str("ffn"),
        }
    }
}

impl FromStr for ExpertShardPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expert" | "expert-axis" => Ok(Self::ExpertAxis),
            "ffn" | "ffn-axis" => Ok(Self::FfnAxis),
            other => Err(format!("unknown expert sharding '{other}', expected 'expert' or 'ffn'")),
        }
    }
}

/// Which experts (and which part of them) this rank holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpertPartition {
    policy: ExpertShardPolicy,
    num_experts: usize,
    first_local: usize,
    num_local: usize,
    local_ffn: usize,
}

impl ExpertPartition {
    pub fn new(
        policy: ExpertShardPolicy,
        num_experts: usize,
        ffn_hidden_size: usize,
        spec: ShardSpec,
    ) -> Result<Self, MoeError> {
        let world_size = spec.world_size();
        match policy {
            ExpertShardPolicy::ExpertAxis => {
                let (first_local, num_local) = spec
                    .even_range(num_experts)
                    .ok_or(MoeError::IndivisibleExperts {
                        num_experts,
                        world_size,
                    })?;
                Ok(Self {
                    policy,
                    num_experts,
                    first_local,
                    num_local,
                    local_ffn: ffn_hidden_size,
                })
            }
            ExpertShardPolicy::FfnAxis => Ok(Self {
                policy,
                num_experts,
                first_local: 0,
                num_local: num_experts,
                local_ffn: ffn_hidden_size / world_size,
            }),
        }
    }

    pub fn policy(&self) -> ExpertShardPolicy {
        self.policy
    }

    pub fn num_local_experts(&self) -> usize {
        self.num_local
    }

    pub fn local_ffn(&self) -> usize {
        self.local_ffn
    }

    pub fn is_local(&self, global_id: usize) -> bool {
        (self.first_local..self.first_local + self.num_local).contains(&global_id)
    }

    /// Global expert id → local id, or [`REMOTE_EXPERT`].
    pub fn to_local(&self, global_id: u32) -> u32 {
        let g = global_id as usize;
        if self.is_local(g) {
            (g - self.first_local) as u32
        } else {
            REMOTE_EXPERT
        }
    }

    /// Map a `[tokens, k]` tensor of global ids to local ids.
    pub fn localize(&self, top_experts: &Tensor) -> candle_core::Result<Tensor> {
        if self.first_local == 0 && self.num_local == self.num_experts {
            return Ok(top_experts.clone());
        }
        let dims = top_experts.dims().to_vec();
        let ids: Vec<u32> = top_experts.flatten_all()?.to_vec1()?;
        let local: Vec<u32> = ids.into_iter().map(|g| self.to_local(g)).collect();
        Tensor::from_vec(local, dims, top_experts.device())
    }
}

/// Per-expert weights as loaded, each `[local_experts, local_ffn, hidden]`.
#[derive(Debug)]
pub struct LoadExpertWeights {
    pub gate: Tensor,
    pub value: Tensor,
    pub down: Tensor,
}

impl LoadExpertWeights {
    /// Load `{prefix}.w1` (gate), `{prefix}.v1` (value), `{prefix}.w2` (down).
    pub fn load(
        cfg: &DbrxConfig,
        prefix: &str,
        source: &mut dyn WeightSource,
        spec: ShardSpec,
        policy: ExpertShardPolicy,
    ) -> Result<Self, ShardingError> {
        let mut load_one = |suffix: &str| -> Result<Tensor, ShardingError> {
            let name = format!("{prefix}.{suffix}");
            let (e, f, h) = (cfg.num_experts(), cfg.ffn_hidden_size(), cfg.d_model);
            let flat = source.pop_with_shape(&name, &[e * f, h])?;
            let per_expert = flat.reshape((e, f, h))?;
            shard_tensor(&name, per_expert, spec, &AxisPolicy::along(policy.shard_dim()))
        };
        Ok(Self {
            gate: load_one("w1")?,
            value: load_one("v1")?,
            down: load_one("w2")?,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.gate.dims()[0]
    }

    pub fn device(&self) -> &Device {
        self.gate.device()
    }
}

/// Per-rank expert weights, tagged by layout.
#[derive(Debug)]
pub enum ExpertWeightSet {
    /// As loaded; not usable by the fused kernel.
    Load {
        gate: Tensor,
        value: Tensor,
        down: Tensor,
    },
    /// Fused layout: `gate_up [E, 2F, H]`, `down_t [E, H, F]`.
    Compute { gate_up: Tensor, down_t: Tensor },
    /// A repack failed midway.
    Poisoned,
}

impl From<LoadExpertWeights> for ExpertWeightSet {
    fn from(w: LoadExpertWeights) -> Self {
        Self::Load {
            gate: w.gate,
            value: w.value,
            down: w.down,
        }
    }
}

impl ExpertWeightSet {
    pub fn is_repacked(&self) -> bool {
        matches!(self, Self::Compute { .. })
    }

    /// `(gate_up, down_t)` if repacked.
    pub fn compute(&self) -> Result<(&Tensor, &Tensor), MoeError> {
        match self {
            Self::Compute { gate_up, down_t } => Ok((gate_up, down_t)),
            Self::Load { .. } => Err(MoeError::NotRepacked),
            Self::Poisoned => Err(MoeError::Poisoned),
        }
    }
}

/// Fuse `gate`/`value` into `gate_up` and transpose `down`.
///
/// `gate` and `value` are released as soon as `gate_up` exists, before the
/// transposed copy of `down` is allocated.
pub fn repack(
    gate: Tensor,
    value: Tensor,
    down: Tensor,
    num_experts: usize,
) -> Result<(Tensor, Tensor), MoeError> {
    let (e, f, h) = gate.dims3()?;
    for (what, t) in [("value", &value), ("down", &down)] {
        if t.dims() != [e, f, h] {
            return Err(MoeError::ShapeMismatch {
                what,
                expected: vec![e, f, h],
                actual: t.dims().to_vec(),
            });
        }
    }
    if e != num_experts {
        return Err(MoeError::ShapeMismatch {
            what: "gate",
            expected: vec![num_experts, f, h],
            actual: gate.dims().to_vec(),
        });
    }

    let gate_up = Tensor::cat(&[&gate, &value], 1)?;
    drop(gate);
    drop(value);

    let down_t = down.transpose(1, 2)?.contiguous()?;
    drop(down);
    Ok((gate_up, down_t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::TensorMap;
    use candle_core::IndexOp;

    fn ramp(shape: (usize, usize, usize)) -> Tensor {
        let n = shape.0 * shape.1 * shape.2;
        Tensor::arange(0f32, n as f32, &Device::Cpu)
            .unwrap()
            .reshape(shape)
            .unwrap()
    }

    #[test]
    fn test_repack_matches_reference_concat_and_transpose() {
        let gate = ramp((3, 2, 4));
        let value = (ramp((3, 2, 4)) + 100.0).unwrap();
        let down = (ramp((3, 2, 4)) + 1000.0).unwrap();

        let (gate_up, down_t) = repack(gate.clone(), value.clone(), down.clone(), 3).unwrap();
        assert_eq!(gate_up.dims(), &[3, 4, 4]);
        assert_eq!(down_t.dims(), &[3, 4, 2]);

        for e in 0..3 {
            let expected = Tensor::cat(&[gate.i(e).unwrap(), value.i(e).unwrap()], 0).unwrap();
            assert_eq!(
                gate_up.i(e).unwrap().to_vec2::<f32>().unwrap(),
                expected.to_vec2::<f32>().unwrap()
            );
            assert_eq!(
                down_t.i(e).unwrap().to_vec2::<f32>().unwrap(),
                down.i(e).unwrap().t().unwrap().to_vec2::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn test_repack_rejects_mismatched_shapes() {
        let err = repack(ramp((2, 2, 4)), ramp((2, 3, 4)), ramp((2, 2, 4)), 2).unwrap_err();
        assert!(matches!(err, MoeError::ShapeMismatch { what: "value", .. }));

        let err = repack(ramp((2, 2, 4)), ramp((2, 2, 4)), ramp((2, 2, 4)), 4).unwrap_err();
        assert!(matches!(err, MoeError::ShapeMismatch { what: "gate", .. }));
    }

    #[test]
    fn test_expert_axis_partition_localizes_ids() {
        let spec = ShardSpec::new(1, 2).unwrap();
        let p = ExpertPartition::new(ExpertShardPolicy::ExpertAxis, 4, 8, spec).unwrap();
        assert_eq!(p.num_local_experts(), 2);
        assert_eq!(p.local_ffn(), 8);
        assert_eq!(p.to_local(3), 1);
        assert_eq!(p.to_local(1), REMOTE_EXPERT);

        let ids = Tensor::new(&[[3u32, 0], [2, 1]], &Device::Cpu).unwrap();
        let local: Vec<Vec<u32>> = p.localize(&ids).unwrap().to_vec2().unwrap();
        assert_eq!(local, vec![vec![1, REMOTE_EXPERT], vec![0, REMOTE_EXPERT]]);
    }

    #[test]
    fn test_ffn_axis_partition_keeps_all_experts() {
        let spec = ShardSpec::new(1, 2).unwrap();
        let p = ExpertPartition::new(ExpertShardPolicy::FfnAxis, 4, 8, spec).unwrap();
        assert_eq!(p.num_local_experts(), 4);
        assert_eq!(p.local_ffn(), 4);
        let ids = Tensor::new(&[[3u32]], &Device::Cpu).unwrap();
        assert_eq!(p.localize(&ids).unwrap().id(), ids.id());
    }

    #[test]
    fn test_expert_axis_requires_divisible_experts() {
        let spec = ShardSpec::new(0, 3).unwrap();
        assert!(matches!(
            ExpertPartition::new(ExpertShardPolicy::ExpertAxis, 4, 8, spec),
            Err(MoeError::IndivisibleExperts { .. })
        ));
    }

    #[test]
    fn test_policy_parses_from_cli_names() {
        assert_eq!("expert".parse::<ExpertShardPolicy>().unwrap(), ExpertShardPolicy::ExpertAxis);
        assert_eq!("FFN".parse::<ExpertShardPolicy>().unwrap(), ExpertShardPolicy::FfnAxis);
        assert!("rows".parse::<ExpertShardPolicy>().is_err());
        assert_eq!(ExpertShardPolicy::FfnAxis.to_string(), "ffn");
    }

    #[test]
    fn test_load_shards_along_policy_axis() {
        let cfg = crate::testing::tiny_dbrx_config();
        let (e, f, h) = (cfg.num_experts(), cfg.ffn_hidden_size(), cfg.d_model);
        let flat = Tensor::arange(0f32, (e * f * h) as f32, &Device::Cpu)
            .unwrap()
            .reshape((e * f, h))
            .unwrap();

        for (policy, expected) in [
            (ExpertShardPolicy::ExpertAxis, [e / 2, f, h]),
            (ExpertShardPolicy::FfnAxis, [e, f / 2, h]),
        ] {
            let mut source = TensorMap::new();
            for name in ["w1", "v1", "w2"] {
                source.insert(format!("mlp.{name}"), flat.clone());
            }
            let spec = ShardSpec::new(1, 2).unwrap();
            let w = LoadExpertWeights::load(&cfg, "mlp", &mut source, spec, policy).unwrap();
            assert_eq!(w.gate.dims(), &expected);
            assert_eq!(w.down.dims(), &expected);
            assert!(source.is_empty());

            // Rank 1's first element is the first element of its slice.
            let first: f32 = w.gate.flatten_all().unwrap().i(0).unwrap().to_scalar().unwrap();
            let expected_first = match policy {
                ExpertShardPolicy::ExpertAxis => (e / 2 * f * h) as f32,
                ExpertShardPolicy::FfnAxis => (f / 2 * h) as f32,
            };
            assert_eq!(first, expected_first);
        }
    }
}
