//! DBRX under tensor parallelism.
//!
//! Weight layout (HuggingFace `transformer.*` names):
//! - `wte`: replicated token embedding
//! - `blocks.{i}.norm_attn_norm.{norm_1, attn, norm_2}`: pre-norm attention
//! - `blocks.{i}.ffn.{router, experts.mlp}`: replicated router, sharded experts
//! - `norm_f`: final LayerNorm (no bias)
//!
//! A forward pass runs over the concatenation of every scheduled sequence
//! without a mask; per-sequence boundaries come from the [`BatchContext`].

mod attention;

pub use attention::DbrxAttention;

use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, LayerNorm};
use tracing::{debug, info};

use crate::batch::BatchContext;
use crate::config::DbrxConfig;
use crate::distributed::{load_replicated, DeviceCommunicator, ShardSpec, WeightSource};
use crate::kv_cache::{CacheError, KvCaches, PagedKvCache};
use crate::moe::{DbrxExperts, DbrxRouter, ExpertShardPolicy, MoeError};

fn load_layer_norm(
    cfg: &DbrxConfig,
    prefix: &str,
    source: &mut dyn WeightSource,
) -> crate::Result<LayerNorm> {
    let weight = load_replicated(source, &format!("{prefix}.weight"), &[cfg.d_model])?;
    Ok(LayerNorm::new_no_bias(weight, cfg.layer_norm_epsilon))
}

// ─── FFN ─────────────────────────────────────────────────────────────────────

/// Router + sharded experts.
#[derive(Debug)]
pub struct DbrxFfn {
    router: DbrxRouter,
    experts: DbrxExperts,
}

impl DbrxFfn {
    pub fn load(
        cfg: &DbrxConfig,
        prefix: &str,
        source: &mut dyn WeightSource,
        comm: Arc<dyn DeviceCommunicator>,
        policy: ExpertShardPolicy,
    ) -> crate::Result<Self> {
        let router = DbrxRouter::load(cfg, &format!("{prefix}.router"), source)?;
        let experts = DbrxExperts::load(cfg, &format!("{prefix}.experts.mlp"), source, comm, policy)?;
        Ok(Self { router, experts })
    }

    pub fn router(&self) -> &DbrxRouter {
        &self.router
    }

    pub fn experts(&self) -> &DbrxExperts {
        &self.experts
    }

    pub fn repack(&mut self) -> Result<(), MoeError> {
        self.experts.repack()
    }

    pub fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        let assignment = self.router.route(xs)?;
        self.experts.forward(xs, &assignment)
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DbrxBlock {
    norm_1: LayerNorm,
    attn: DbrxAttention,
    norm_2: LayerNorm,
    ffn: DbrxFfn,
}

impl DbrxBlock {
    /// Load `transformer.blocks.{layer}`.
    pub fn load(
        cfg: &DbrxConfig,
        layer: usize,
        source: &mut dyn WeightSource,
        comm: Arc<dyn DeviceCommunicator>,
        policy: ExpertShardPolicy,
    ) -> crate::Result<Self> {
        let prefix = format!("transformer.blocks.{layer}");
        let norm_attn_norm = format!("{prefix}.norm_attn_norm");
        Ok(Self {
            norm_1: load_layer_norm(cfg, &format!("{norm_attn_norm}.norm_1"), source)?,
            attn: DbrxAttention::load(cfg, &format!("{norm_attn_norm}.attn"), source, comm.clone())?,
            norm_2: load_layer_norm(cfg, &format!("{norm_attn_norm}.norm_2"), source)?,
            ffn: DbrxFfn::load(cfg, &format!("{prefix}.ffn"), source, comm, policy)?,
        })
    }

    pub fn attention(&self) -> &DbrxAttention {
        &self.attn
    }

    pub fn ffn(&self) -> &DbrxFfn {
        &self.ffn
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        ctx: &BatchContext,
        cache: &mut PagedKvCache,
    ) -> crate::Result<Tensor> {
        let residual = xs;
        let attn_out = self.attn.forward(&self.norm_1.forward(xs)?, ctx, cache)?;
        let xs = (residual + attn_out)?;
        let ffn_out = self.ffn.forward(&self.norm_2.forward(&xs)?)?;
        Ok((xs + ffn_out)?)
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

/// DBRX decoder stack on one rank. Returns final hidden states; the LM head
/// and sampling live outside this crate.
pub struct DbrxModel {
    wte: Embedding,
    blocks: Vec<DbrxBlock>,
    norm_f: LayerNorm,
    comm: Arc<dyn DeviceCommunicator>,
    config: DbrxConfig,
}

impl std::fmt::Debug for DbrxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbrxModel")
            .field("shard_spec", &self.comm.shard_spec())
            .field("num_layers", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

impl DbrxModel {
    /// Load every block's shard for the communicator's rank. Weights are
    /// popped from `source` as they are consumed.
    pub fn load(
        cfg: &DbrxConfig,
        source: &mut dyn WeightSource,
        comm: Arc<dyn DeviceCommunicator>,
        policy: ExpertShardPolicy,
    ) -> crate::Result<Self> {
        cfg.validate()?;
        let spec = comm.shard_spec();
        cfg.validate_tensor_parallel(spec.world_size())?;

        let wte_weight = load_replicated(
            source,
            "transformer.wte.weight",
            &[cfg.vocab_size, cfg.d_model],
        )?;
        let wte = Embedding::new(wte_weight, cfg.d_model);

        let mut blocks = Vec::with_capacity(cfg.n_layers);
        for layer in 0..cfg.n_layers {
            blocks.push(DbrxBlock::load(cfg, layer, source, comm.clone(), policy)?);
            debug!(rank = spec.rank(), layer, "loaded block");
        }
        let norm_f = load_layer_norm(cfg, "transformer.norm_f", source)?;

        info!(
            rank = spec.rank(),
            world_size = spec.world_size(),
            layers = cfg.n_layers,
            expert_sharding = %policy,
            "DBRX shards loaded"
        );
        Ok(Self {
            wte,
            blocks,
            norm_f,
            comm,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &DbrxConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[DbrxBlock] {
        &self.blocks
    }

    pub fn shard_spec(&self) -> ShardSpec {
        self.comm.shard_spec()
    }

    /// Move every layer's experts into the fused layout, then wait for all
    /// ranks. Must run once before the first forward.
    pub fn repack_experts(&mut self) -> crate::Result<()> {
        let spec = self.comm.shard_spec();
        for (layer, block) in self.blocks.iter_mut().enumerate() {
            block.ffn.repack()?;
            debug!(rank = spec.rank(), layer, "repacked experts");
        }
        info!(rank = spec.rank(), layers = self.blocks.len(), "experts repacked");
        self.comm.barrier()?;
        Ok(())
    }

    /// `input_ids [tokens]` (u32, all sequences concatenated) → `[tokens, hidden]`.
    ///
    /// `caches` holds one layer of paged KV state per block; it is written
    /// only at the slots the batch context names.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        ctx: &BatchContext,
        caches: &mut KvCaches,
    ) -> crate::Result<Tensor> {
        if caches.num_layers() < self.blocks.len() {
            return Err(CacheError::LayerOutOfRange {
                layer: self.blocks.len() - 1,
                num_layers: caches.num_layers(),
            }
            .into());
        }
        ctx.check_tokens(input_ids.dim(0)?)?;
        ctx.check_seq_len(self.config.max_seq_len)?;

        let spec = self.comm.shard_spec();
        debug!(
            rank = spec.rank(),
            world_size = spec.world_size(),
            tokens = ctx.total_tokens(),
            sequences = ctx.num_sequences(),
            "forward"
        );

        let mut xs = self.wte.forward(input_ids)?;
        for (layer, (block, cache)) in self.blocks.iter().zip(caches.iter_mut()).enumerate() {
            xs = block.forward(&xs, ctx, cache)?;
            debug!(rank = spec.rank(), layer, "block done");
        }
        Ok(self.norm_f.forward(&xs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchContextError, SequenceSlice};
    use crate::distributed::LocalCommunicator;
    use crate::testing::{random_dbrx_weights, tiny_cache_config, tiny_dbrx_config};
    use crate::Error;
    use candle_core::{DType, Device};

    fn load_model() -> DbrxModel {
        let cfg = tiny_dbrx_config();
        let mut weights = random_dbrx_weights(&cfg, 11, &Device::Cpu).unwrap();
        let model = DbrxModel::load(
            &cfg,
            &mut weights,
            Arc::new(LocalCommunicator::new()),
            ExpertShardPolicy::default(),
        )
        .unwrap();
        assert!(weights.is_empty(), "unused weights: {:?}", weights.names());
        model
    }

    #[test]
    fn test_forward_requires_repack() {
        let model = load_model();
        let cfg = model.config().clone();
        let mut caches = KvCaches::new(&tiny_cache_config(&cfg, 1)).unwrap();
        let ctx = BatchContext::from_sequences(&[SequenceSlice::prefill(2, vec![0])]).unwrap();
        let ids = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();

        let err = model.forward(&ids, &ctx, &mut caches).unwrap_err();
        assert!(matches!(err, Error::Moe(MoeError::NotRepacked)));
    }

    #[test]
    fn test_second_repack_fails() {
        let mut model = load_model();
        model.repack_experts().unwrap();
        let err = model.repack_experts().unwrap_err();
        assert!(matches!(err, Error::Moe(MoeError::AlreadyRepacked)));
    }

    #[test]
    fn test_forward_shape() {
        let mut model = load_model();
        model.repack_experts().unwrap();
        let cfg = model.config().clone();
        let mut caches = KvCaches::new(&tiny_cache_config(&cfg, 1)).unwrap();
        let ctx = BatchContext::from_sequences(&[
            SequenceSlice::prefill(3, vec![0]),
            SequenceSlice::prefill(1, vec![1]),
        ])
        .unwrap();
        let ids = Tensor::new(&[1u32, 2, 3, 4], &Device::Cpu).unwrap();

        let out = model.forward(&ids, &ctx, &mut caches).unwrap();
        assert_eq!(out.dims(), &[4, cfg.d_model]);
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn test_too_few_cache_layers_rejected() {
        let mut model = load_model();
        model.repack_experts().unwrap();
        let mut cache_cfg = tiny_cache_config(model.config(), 1);
        cache_cfg.num_layers = 1;
        let mut caches = KvCaches::new(&cache_cfg).unwrap();
        let ctx = BatchContext::from_sequences(&[SequenceSlice::prefill(1, vec![0])]).unwrap();
        let ids = Tensor::new(&[1u32], &Device::Cpu).unwrap();

        let err = model.forward(&ids, &ctx, &mut caches).unwrap_err();
        assert!(matches!(err, Error::Cache(CacheError::LayerOutOfRange { .. })));
    }

    #[test]
    fn test_sequence_over_max_len_rejected_before_cache_write() {
        let cfg = DbrxConfig {
            max_seq_len: 4,
            ..tiny_dbrx_config()
        };
        let mut weights = random_dbrx_weights(&cfg, 11, &Device::Cpu).unwrap();
        let mut model = DbrxModel::load(
            &cfg,
            &mut weights,
            Arc::new(LocalCommunicator::new()),
            ExpertShardPolicy::default(),
        )
        .unwrap();
        model.repack_experts().unwrap();
        let mut caches = KvCaches::new(&tiny_cache_config(&cfg, 1)).unwrap();
        let ctx = BatchContext::from_sequences(&[
            SequenceSlice::prefill(2, vec![0]),
            SequenceSlice::prefill(9, vec![1, 2, 3]),
        ])
        .unwrap();
        let ids = Tensor::arange(0u32, 11, &Device::Cpu).unwrap();

        let err = model.forward(&ids, &ctx, &mut caches).unwrap_err();
        assert!(matches!(
            err,
            Error::BatchContext(BatchContextError::SequenceTooLong {
                seq: 1,
                kv_len: 9,
                max: 4
            })
        ));
        for cache in caches.iter_mut() {
            let sum: f32 = cache.key_cache().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert_eq!(sum, 0.0);
            let sum: f32 = cache.value_cache().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert_eq!(sum, 0.0);
        }
    }

    #[test]
    fn test_missing_weight_fails_load() {
        let cfg = tiny_dbrx_config();
        let mut weights = random_dbrx_weights(&cfg, 3, &Device::Cpu).unwrap();
        weights.pop("transformer.norm_f.weight").unwrap();
        let err = DbrxModel::load(
            &cfg,
            &mut weights,
            Arc::new(LocalCommunicator::new()),
            ExpertShardPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Sharding(_)));
    }
}
