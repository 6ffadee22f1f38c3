//! Sharded DBRX expert block.

use std::sync::Arc;

use candle_core::{Tensor, D};
use tracing::debug;

use super::error::MoeError;
use super::expert_weights::{repack, ExpertPartition, ExpertShardPolicy, ExpertWeightSet, LoadExpertWeights};
use super::router::ExpertAssignment;
use crate::config::DbrxConfig;
use crate::distributed::{DeviceCommunicator, OutputReduction};
use crate::kernels::fused_moe;

/// The expert half of a DBRX FFN on one rank.
///
/// Holds this rank's experts (or expert slices), runs them through the fused
/// kernel and sums the partial outputs across ranks. The reduction runs on
/// every call when sharded, whether or not any token hit a local expert.
#[derive(Debug)]
pub struct DbrxExperts {
    weights: ExpertWeightSet,
    partition: ExpertPartition,
    reduction: OutputReduction,
}

impl DbrxExperts {
    /// Load `{prefix}.w1`, `{prefix}.v1`, `{prefix}.w2` and keep this rank's part.
    pub fn load(
        cfg: &DbrxConfig,
        prefix: &str,
        source: &mut dyn crate::distributed::WeightSource,
        comm: Arc<dyn DeviceCommunicator>,
        policy: ExpertShardPolicy,
    ) -> crate::Result<Self> {
        let spec = comm.shard_spec();
        let partition = ExpertPartition::new(policy, cfg.num_experts(), cfg.ffn_hidden_size(), spec)?;
        let weights = LoadExpertWeights::load(cfg, prefix, source, spec, policy)?;
        Ok(Self::new(weights, partition, OutputReduction::for_communicator(comm)))
    }

    pub fn new(weights: LoadExpertWeights, partition: ExpertPartition, reduction: OutputReduction) -> Self {
        Self {
            weights: weights.into(),
            partition,
            reduction,
        }
    }

    pub fn partition(&self) -> &ExpertPartition {
        &self.partition
    }

    pub fn is_repacked(&self) -> bool {
        self.weights.is_repacked()
    }

    pub fn weights(&self) -> &ExpertWeightSet {
        &self.weights
    }

    /// One-time transition into the fused layout.
    ///
    /// The load tensors are consumed. On failure the module is left
    /// [`ExpertWeightSet::Poisoned`]; a second call on a repacked module
    /// fails without touching the compute tensors.
    pub fn repack(&mut self) -> Result<(), MoeError> {
        match std::mem::replace(&mut self.weights, ExpertWeightSet::Poisoned) {
            ExpertWeightSet::Load { gate, value, down } => {
                let (gate_up, down_t) = repack(gate, value, down, self.partition.num_local_experts())?;
                self.weights = ExpertWeightSet::Compute { gate_up, down_t };
                Ok(())
            }
            compute @ ExpertWeightSet::Compute { .. } => {
                self.weights = compute;
                Err(MoeError::AlreadyRepacked)
            }
            ExpertWeightSet::Poisoned => Err(MoeError::Poisoned),
        }
    }

    /// `hidden_states [..., hidden]` → `[..., hidden]`, summed across ranks.
    pub fn forward(&self, hidden_states: &Tensor, assignment: &ExpertAssignment) -> crate::Result<Tensor> {
        let (gate_up, down_t) = self.weights.compute()?;

        let dims = hidden_states.dims().to_vec();
        let hidden = hidden_states.dim(D::Minus1)?;
        let xs = hidden_states.reshape(((), hidden))?;
        let num_tokens = xs.dim(0)?;

        let topk = assignment.top_weights.dim(D::Minus1)?;
        let top_weights = assignment.top_weights.reshape((num_tokens, topk))?;
        let top_experts = self
            .partition
            .localize(&assignment.top_experts.reshape((num_tokens, topk))?)?;

        debug!(
            tokens = num_tokens,
            topk,
            local_experts = self.partition.num_local_experts(),
            "expert dispatch"
        );
        let out = fused_moe(&xs, gate_up, down_t, &top_weights, &top_experts, topk, false)?;
        let out = out.reshape(dims)?;
        Ok(self.reduction.apply(out)?)
    }
}
