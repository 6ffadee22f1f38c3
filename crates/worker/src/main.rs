mod launcher;
mod logging;
mod synthetic;

use std::path::PathBuf;

use clap::Parser;
use dbrx_tp_core::moe::ExpertShardPolicy;

use launcher::LaunchConfig;

#[derive(Parser)]
#[command(
    name = "dbrx-tp-worker",
    about = "Run one tensor-parallel DBRX forward pass over a continuous batch"
)]
struct Cli {
    /// Number of tensor-parallel ranks (one thread each)
    #[arg(long, default_value_t = 1)]
    world_size: usize,

    /// HuggingFace config.json; the built-in demo config when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors weight files; seeded random weights when omitted
    #[arg(long, value_delimiter = ',')]
    weights: Vec<PathBuf>,

    /// Prompt lengths of the sequences batched together
    #[arg(long, value_delimiter = ',', default_value = "5,3,7")]
    seq_lens: Vec<usize>,

    /// Tokens per KV cache block
    #[arg(long, default_value_t = 16)]
    block_size: usize,

    /// KV cache blocks per layer on each rank
    #[arg(long, default_value_t = 64)]
    num_blocks: usize,

    /// Expert partitioning: "expert" (disjoint expert subsets) or "ffn"
    /// (every expert's intermediate dimension split)
    #[arg(long, default_value_t = ExpertShardPolicy::ExpertAxis)]
    expert_sharding: ExpertShardPolicy,

    /// Seed for random weights and token ids
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, logging::LogFormat::from_env())?;

    let model_config = LaunchConfig::resolve_model_config(cli.config.as_ref(), &cli.weights)?;
    let config = LaunchConfig {
        world_size: cli.world_size,
        model_config,
        weights: cli.weights,
        seq_lens: cli.seq_lens,
        block_size: cli.block_size,
        num_blocks: cli.num_blocks,
        expert_sharding: cli.expert_sharding,
        seed: cli.seed,
    };
    tracing::info!(
        world_size = config.world_size,
        seq_lens = ?config.seq_lens,
        expert_sharding = %config.expert_sharding,
        random_weights = config.weights.is_empty(),
        "launching ranks"
    );

    let summaries = launcher::launch(&config)?;
    for s in &summaries {
        println!(
            "rank {}: {} tokens x {} hidden, checksum {:.6}, load {} ms, forward {} ms",
            s.rank, s.tokens, s.hidden_size, s.checksum, s.load_ms, s.forward_ms
        );
    }
    Ok(())
}
