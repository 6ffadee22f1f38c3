//! In-process launcher: one thread per tensor-parallel rank.
//!
//! Every rank thread loads its shard, repacks its experts, waits for the
//! others, then runs one continuous-batched prefill over the requested
//! sequence lengths. Ranks talk through an [`InProcessGroup`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use dbrx_tp_core::distributed::{DeviceCommunicator, InProcessCommunicator, InProcessGroup, TensorMap};
use dbrx_tp_core::kv_cache::{CacheConfig, KvCaches};
use dbrx_tp_core::moe::ExpertShardPolicy;
use dbrx_tp_core::{BatchContext, DbrxConfig, DbrxModel};

use crate::synthetic;

/// Everything a rank needs to run, shared read-only by all rank threads.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub world_size: usize,
    pub model_config: DbrxConfig,
    /// Safetensors shards; random weights from `seed` when empty.
    pub weights: Vec<PathBuf>,
    pub seq_lens: Vec<usize>,
    pub block_size: usize,
    pub num_blocks: usize,
    pub expert_sharding: ExpertShardPolicy,
    pub seed: u64,
}

impl LaunchConfig {
    /// Model config from `config.json`, or the built-in demo config.
    pub fn resolve_model_config(
        path: Option<&PathBuf>,
        weights: &[PathBuf],
    ) -> anyhow::Result<DbrxConfig> {
        match path {
            Some(path) => Ok(DbrxConfig::from_file(path)?),
            None if weights.is_empty() => Ok(synthetic::demo_config()),
            None => anyhow::bail!("--weights requires --config"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.seq_lens.is_empty(), "--seq-lens must name at least one sequence");
        anyhow::ensure!(self.seq_lens.iter().all(|&n| n > 0), "sequence lengths must be positive");
        self.model_config.validate()?;
        self.model_config.validate_tensor_parallel(self.world_size)?;
        let max = self.model_config.max_seq_len;
        anyhow::ensure!(
            self.seq_lens.iter().all(|&n| n <= max),
            "sequence lengths {:?} exceed max_seq_len {max}",
            self.seq_lens
        );
        let blocks: usize = self
            .seq_lens
            .iter()
            .map(|n| n.div_ceil(self.block_size))
            .sum();
        anyhow::ensure!(
            blocks <= self.num_blocks,
            "{blocks} blocks needed for {:?}, cache has {}",
            self.seq_lens,
            self.num_blocks
        );
        Ok(())
    }

    fn token_ids(&self) -> Vec<u32> {
        let vocab = self.model_config.vocab_size as u64;
        let total: usize = self.seq_lens.iter().sum();
        (0..total as u64)
            .map(|i| ((i * 31 + self.seed) % vocab) as u32)
            .collect()
    }
}

/// What one rank reports after its forward pass.
#[derive(Debug, Clone)]
pub struct RankSummary {
    pub rank: usize,
    pub tokens: usize,
    pub hidden_size: usize,
    /// Sum of every output element, in f32.
    pub checksum: f32,
    pub load_ms: u64,
    pub forward_ms: u64,
}

/// Run every rank to completion and return their summaries in rank order.
pub fn launch(config: &LaunchConfig) -> anyhow::Result<Vec<RankSummary>> {
    config.validate()?;
    let comms = InProcessGroup::new(config.world_size)?;

    std::thread::scope(|s| {
        let handles = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(s, move || run_rank(config, comm))
                    .with_context(|| format!("failed to spawn rank {rank}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .map_err(|_| anyhow::anyhow!("rank {rank} panicked"))?
            })
            .collect()
    })
}

fn load_weights(config: &LaunchConfig, device: &Device) -> anyhow::Result<TensorMap> {
    if config.weights.is_empty() {
        return Ok(synthetic::random_weights(&config.model_config, config.seed, device)?);
    }
    TensorMap::from_safetensors(config.weights.as_slice(), device).context("failed to read safetensors")
}

fn run_rank(config: &LaunchConfig, comm: InProcessCommunicator) -> anyhow::Result<RankSummary> {
    let rank = comm.rank();
    let comm: Arc<dyn DeviceCommunicator> = Arc::new(comm);
    let device = Device::cuda_if_available(rank)?;

    let started = Instant::now();
    let mut weights = load_weights(config, &device)?;
    let dtype = weights
        .get("transformer.wte.weight")
        .map(|t| t.dtype())
        .unwrap_or(DType::F32);
    let mut model = DbrxModel::load(
        &config.model_config,
        &mut weights,
        Arc::clone(&comm),
        config.expert_sharding,
    )
    .with_context(|| format!("rank {rank}: failed to load model"))?;
    if !weights.is_empty() {
        tracing::warn!(rank, unused = weights.len(), "weights left over after load");
    }
    drop(weights);
    model.repack_experts()?;
    let load_ms = started.elapsed().as_millis() as u64;

    let cfg = model.config();
    let mut caches = KvCaches::new(&CacheConfig {
        block_size: config.block_size,
        num_blocks: config.num_blocks,
        num_layers: cfg.n_layers,
        num_kv_heads: cfg.num_kv_heads() / config.world_size,
        head_dim: cfg.head_dim(),
        dtype,
        device: device.clone(),
    })?;
    let ctx = BatchContext::from_sequences(&synthetic::prefill_batch(&config.seq_lens, config.block_size))?;
    let input_ids = Tensor::new(config.token_ids().as_slice(), &device)?;

    let started = Instant::now();
    let hidden = model.forward(&input_ids, &ctx, &mut caches)?;
    let forward_ms = started.elapsed().as_millis() as u64;

    let (tokens, hidden_size) = hidden.dims2()?;
    let checksum: f32 = hidden.to_dtype(DType::F32)?.sum_all()?.to_scalar()?;
    tracing::info!(rank, tokens, load_ms, forward_ms, checksum, "forward complete");

    Ok(RankSummary {
        rank,
        tokens,
        hidden_size,
        checksum,
        load_ms,
        forward_ms,
    })
}
