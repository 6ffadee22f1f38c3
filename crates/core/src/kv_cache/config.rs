use candle_core::{DType, Device};

use super::error::CacheError;

/// Geometry of one rank's paged KV cache.
///
/// `num_kv_heads` is the rank-local head count: the KV heads are sharded with
/// the attention projection, so each rank only caches its own heads.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub device: Device,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        let fields = [
            ("block_size", self.block_size),
            ("num_blocks", self.num_blocks),
            ("num_layers", self.num_layers),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(CacheError::InvalidGeometry {
                    field,
                    reason: "must be > 0",
                });
            }
        }
        Ok(())
    }
}
