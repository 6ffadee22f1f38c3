use candle_core::Tensor;

use super::config::CacheConfig;
use super::error::CacheError;

/// Owns pre-allocated tensors for one layer's KV cache.
///
/// Cache layout: [num_blocks, block_size, num_kv_heads, head_dim]
/// This layout allows direct reshape to [num_blocks * block_size, kv_heads, head_dim] for scatter/gather.
///
/// The tensors are allocated once and never resized; writers only touch the
/// slots they are given.
#[derive(Debug)]
pub struct PagedKvCache {
    key_cache: Tensor,
    value_cache: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl PagedKvCache {
    /// Pre-allocate cache tensors, filled with zeros.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let shape = (
            config.num_blocks,
            config.block_size,
            config.num_kv_heads,
            config.head_dim,
        );
        let key_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        let value_cache = Tensor::zeros(shape, config.dtype, &config.device)?;

        Ok(Self {
            key_cache,
            value_cache,
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
        })
    }

    /// Raw K cache tensor `[num_blocks, block_size, kv_heads, head_dim]`.
    pub fn key_cache(&self) -> &Tensor {
        &self.key_cache
    }

    /// Raw V cache tensor `[num_blocks, block_size, kv_heads, head_dim]`.
    pub fn value_cache(&self) -> &Tensor {
        &self.value_cache
    }

    /// Both cache tensors, for kernels that write in place.
    ///
    /// Requires `&mut self` so a single writer holds the cache at a time.
    pub fn tensors_mut(&mut self) -> (&Tensor, &Tensor) {
        (&self.key_cache, &self.value_cache)
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Read K, V for the first `num_tokens` slots of a sequence.
    ///
    /// block_ids: ordered physical block IDs of the sequence
    ///
    /// Returns (k, v) each with shape [num_tokens, num_kv_heads, head_dim].
    #[cfg(test)]
    pub(crate) fn read(&self, block_ids: &[u32], num_tokens: usize) -> Result<(Tensor, Tensor), CacheError> {
        let num_blocks_used = block_ids.len();
        let indices = Tensor::from_slice(block_ids, (num_blocks_used,), self.key_cache.device())?;

        // index_select on dim 0: selects blocks
        let k_raw = self.key_cache.index_select(&indices, 0)?;
        let v_raw = self.value_cache.index_select(&indices, 0)?;

        let total_capacity = num_blocks_used * self.block_size;
        let flat = (total_capacity, self.num_kv_heads, self.head_dim);
        let k = k_raw.reshape(flat)?.narrow(0, 0, num_tokens)?;
        let v = v_raw.reshape(flat)?.narrow(0, 0, num_tokens)?;
        Ok((k, v))
    }
}

/// Per-layer caches of one rank.
#[derive(Debug)]
pub struct KvCaches {
    layers: Vec<PagedKvCache>,
}

impl KvCaches {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let layers = (0..config.num_layers)
            .map(|_| PagedKvCache::new(config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> Result<&PagedKvCache, CacheError> {
        let num_layers = self.layers.len();
        self.layers
            .get(layer)
            .ok_or(CacheError::LayerOutOfRange { layer, num_layers })
    }

    pub fn layer_mut(&mut self, layer: usize) -> Result<&mut PagedKvCache, CacheError> {
        let num_layers = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or(CacheError::LayerOutOfRange { layer, num_layers })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PagedKvCache> {
        self.layers.iter_mut()
    }
}
