//! Per-forward batch metadata for continuous batching.
//!
//! A batch is the concatenation of the new tokens of several sequences along
//! one token axis. No padding and no mask: every kernel finds sequence
//! boundaries through `q_start_loc` / `q_seq_length` and the cached history
//! through `kv_seq_length` / `block_offsets`.

use candle_core::{Device, Tensor};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BatchContextError {
    #[error("batch has no sequences")]
    EmptyBatch,

    #[error("{field} has {actual} entries, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("sequence {seq} has no query tokens")]
    EmptyQuery { seq: usize },

    #[error("sequence {seq} starts at {actual}, expected {expected}")]
    NonContiguousStart {
        seq: usize,
        expected: usize,
        actual: usize,
    },

    #[error("sequence {seq}: kv length {kv_len} is shorter than query length {q_len}")]
    KvShorterThanQuery { seq: usize, q_len: usize, kv_len: usize },

    #[error("hidden states have {actual} tokens, batch context expects {expected}")]
    TokenCountMismatch { expected: usize, actual: usize },

    #[error("sequence {seq}: {num_blocks} blocks of {block_size} cannot hold {kv_len} tokens")]
    InsufficientBlocks {
        seq: usize,
        kv_len: usize,
        num_blocks: usize,
        block_size: usize,
    },

    #[error("sequence {seq}: kv length {kv_len} exceeds the model maximum of {max}")]
    SequenceTooLong { seq: usize, kv_len: usize, max: usize },

    #[error("sequence {seq}: block id {block_id} out of range for cache with {num_blocks} blocks")]
    BlockOutOfRange {
        seq: usize,
        block_id: u32,
        num_blocks: usize,
    },
}

/// One sequence's share of a batch, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSlice {
    /// Tokens already in the KV cache.
    pub history_len: usize,
    /// New tokens in this forward pass.
    pub query_len: usize,
    /// Physical block ids, in logical order.
    pub block_ids: Vec<u32>,
}

impl SequenceSlice {
    pub fn new(history_len: usize, query_len: usize, block_ids: Vec<u32>) -> Self {
        Self {
            history_len,
            query_len,
            block_ids,
        }
    }

    /// Prefill of `query_len` tokens into an empty cache.
    pub fn prefill(query_len: usize, block_ids: Vec<u32>) -> Self {
        Self::new(0, query_len, block_ids)
    }
}

/// Read-only metadata shared by every layer of one forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    q_start_loc: Vec<usize>,
    q_seq_length: Vec<usize>,
    kv_seq_length: Vec<usize>,
    block_offsets: Vec<Vec<u32>>,
    position_ids: Vec<u32>,
    max_q_seq_length: usize,
}

impl BatchContext {
    /// Build from raw per-sequence arrays, checking their mutual consistency.
    pub fn new(
        q_start_loc: Vec<usize>,
        q_seq_length: Vec<usize>,
        kv_seq_length: Vec<usize>,
        block_offsets: Vec<Vec<u32>>,
        position_ids: Vec<u32>,
    ) -> Result<Self, BatchContextError> {
        let n = q_seq_length.len();
        if n == 0 {
            return Err(BatchContextError::EmptyBatch);
        }
        for (field, actual) in [
            ("q_start_loc", q_start_loc.len()),
            ("kv_seq_length", kv_seq_length.len()),
            ("block_offsets", block_offsets.len()),
        ] {
            if actual != n {
                return Err(BatchContextError::LengthMismatch {
                    field,
                    expected: n,
                    actual,
                });
            }
        }

        let mut expected_start = 0;
        for seq in 0..n {
            let (q_len, kv_len) = (q_seq_length[seq], kv_seq_length[seq]);
            if q_len == 0 {
                return Err(BatchContextError::EmptyQuery { seq });
            }
            if q_start_loc[seq] != expected_start {
                return Err(BatchContextError::NonContiguousStart {
                    seq,
                    expected: expected_start,
                    actual: q_start_loc[seq],
                });
            }
            if kv_len < q_len {
                return Err(BatchContextError::KvShorterThanQuery { seq, q_len, kv_len });
            }
            expected_start += q_len;
        }
        if position_ids.len() != expected_start {
            return Err(BatchContextError::LengthMismatch {
                field: "position_ids",
                expected: expected_start,
                actual: position_ids.len(),
            });
        }

        let max_q_seq_length = q_seq_length.iter().copied().max().unwrap_or(0);
        Ok(Self {
            q_start_loc,
            q_seq_length,
            kv_seq_length,
            block_offsets,
            position_ids,
            max_q_seq_length,
        })
    }

    /// Build from per-sequence slices; positions continue each sequence's history.
    pub fn from_sequences(seqs: &[SequenceSlice]) -> Result<Self, BatchContextError> {
        let mut q_start_loc = Vec::with_capacity(seqs.len());
        let mut q_seq_length = Vec::with_capacity(seqs.len());
        let mut kv_seq_length = Vec::with_capacity(seqs.len());
        let mut block_offsets = Vec::with_capacity(seqs.len());
        let mut position_ids = Vec::new();

        let mut start = 0;
        for s in seqs {
            q_start_loc.push(start);
            q_seq_length.push(s.query_len);
            kv_seq_length.push(s.history_len + s.query_len);
            block_offsets.push(s.block_ids.clone());
            position_ids.extend((s.history_len..s.history_len + s.query_len).map(|p| p as u32));
            start += s.query_len;
        }
        Self::new(q_start_loc, q_seq_length, kv_seq_length, block_offsets, position_ids)
    }

    pub fn num_sequences(&self) -> usize {
        self.q_seq_length.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.position_ids.len()
    }

    pub fn q_start_loc(&self) -> &[usize] {
        &self.q_start_loc
    }

    pub fn q_seq_length(&self) -> &[usize] {
        &self.q_seq_length
    }

    pub fn kv_seq_length(&self) -> &[usize] {
        &self.kv_seq_length
    }

    pub fn block_offsets(&self) -> &[Vec<u32>] {
        &self.block_offsets
    }

    pub fn position_ids(&self) -> &[u32] {
        &self.position_ids
    }

    pub fn max_q_seq_length(&self) -> usize {
        self.max_q_seq_length
    }

    /// Number of cached tokens preceding sequence `seq`'s new tokens.
    pub fn history_len(&self, seq: usize) -> usize {
        self.kv_seq_length[seq] - self.q_seq_length[seq]
    }

    /// Position ids as a `[tokens]` u32 tensor.
    pub fn position_ids_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(self.position_ids.as_slice(), self.position_ids.len(), device)
    }

    pub fn check_tokens(&self, num_tokens: usize) -> Result<(), BatchContextError> {
        if num_tokens != self.total_tokens() {
            return Err(BatchContextError::TokenCountMismatch {
                expected: self.total_tokens(),
                actual: num_tokens,
            });
        }
        Ok(())
    }

    /// Check every sequence's KV length against the model's `max_seq_len`.
    pub fn check_seq_len(&self, max: usize) -> Result<(), BatchContextError> {
        match self.kv_seq_length.iter().position(|&kv_len| kv_len > max) {
            Some(seq) => Err(BatchContextError::SequenceTooLong {
                seq,
                kv_len: self.kv_seq_length[seq],
                max,
            }),
            None => Ok(()),
        }
    }

    /// Check that every sequence's blocks exist and cover its KV length.
    pub fn check_capacity(&self, block_size: usize, num_blocks: usize) -> Result<(), BatchContextError> {
        for (seq, (blocks, &kv_len)) in self.block_offsets.iter().zip(&self.kv_seq_length).enumerate() {
            if blocks.len() * block_size < kv_len {
                return Err(BatchContextError::InsufficientBlocks {
                    seq,
                    kv_len,
                    num_blocks: blocks.len(),
                    block_size,
                });
            }
            if let Some(&block_id) = blocks.iter().find(|&&b| b as usize >= num_blocks) {
                return Err(BatchContextError::BlockOutOfRange {
                    seq,
                    block_id,
                    num_blocks,
                });
            }
        }
        Ok(())
    }
}
