use crate::batch::SequenceSlice;

/// Block ids `first..` covering `num_tokens` tokens.
pub fn block_ids(first: u32, num_tokens: usize, block_size: usize) -> Vec<u32> {
    let n = num_tokens.div_ceil(block_size) as u32;
    (first..first + n).collect()
}

/// Fresh prefill slices for `seq_lens`, handing out disjoint blocks in order.
pub fn prefill_slices(seq_lens: &[usize], block_size: usize) -> Vec<SequenceSlice> {
    let mut next = 0u32;
    seq_lens
        .iter()
        .map(|&len| {
            let ids = block_ids(next, len, block_size);
            next += ids.len() as u32;
            SequenceSlice::prefill(len, ids)
        })
        .collect()
}
