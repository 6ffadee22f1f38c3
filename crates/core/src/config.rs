//! DBRX model hyper-parameters, as found in a HuggingFace `config.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttnConfig {
    /// Clamp bound applied to the fused QKV activations.
    #[serde(default)]
    pub clip_qkv: Option<f64>,
    pub kv_n_heads: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FfnConfig {
    pub ffn_hidden_size: usize,
    pub moe_num_experts: usize,
    pub moe_top_k: usize,
    /// p of the p-norm used to renormalize the top-k routing weights.
    #[serde(default)]
    pub moe_normalize_expert_weights: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbrxConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub attn_config: AttnConfig,
    pub ffn_config: FfnConfig,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

impl DbrxConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.attn_config.kv_n_heads
    }

    pub fn num_experts(&self) -> usize {
        self.ffn_config.moe_num_experts
    }

    pub fn top_k(&self) -> usize {
        self.ffn_config.moe_top_k
    }

    pub fn ffn_hidden_size(&self) -> usize {
        self.ffn_config.ffn_hidden_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return invalid(format!(
                "d_model {} must be a positive multiple of n_heads {}",
                self.d_model, self.n_heads
            ));
        }
        if self.head_dim() % 2 != 0 {
            return invalid(format!("head_dim {} must be even for rotary", self.head_dim()));
        }
        let kv = self.attn_config.kv_n_heads;
        if kv == 0 || self.n_heads % kv != 0 {
            return invalid(format!(
                "n_heads {} must be a multiple of kv_n_heads {kv}",
                self.n_heads
            ));
        }
        let ffn = &self.ffn_config;
        if ffn.moe_top_k == 0 || ffn.moe_top_k > ffn.moe_num_experts {
            return invalid(format!(
                "moe_top_k {} must be in 1..={}",
                ffn.moe_top_k, ffn.moe_num_experts
            ));
        }
        if let Some(clip) = self.attn_config.clip_qkv {
            if clip <= 0.0 {
                return invalid(format!("clip_qkv {clip} must be positive"));
            }
        }
        Ok(())
    }

    /// Check that attention heads split evenly over `world_size` ranks.
    pub fn validate_tensor_parallel(&self, world_size: usize) -> Result<(), ConfigError> {
        for (what, n) in [("n_heads", self.n_heads), ("kv_n_heads", self.attn_config.kv_n_heads)] {
            if n % world_size != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{what} {n} is not divisible by world_size {world_size}"
                )));
            }
        }
        Ok(())
    }
}
