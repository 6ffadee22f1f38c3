//! Continuous batching on a single rank.
//!
//! Sequences of different lengths are concatenated into one forward pass
//! with no mask; the paged KV cache and the batch context keep them apart.

use std::sync::Arc;

use candle_core::{Device, IndexOp, Tensor};
use dbrx_tp_core::distributed::LocalCommunicator;
use dbrx_tp_core::kv_cache::KvCaches;
use dbrx_tp_core::moe::ExpertShardPolicy;
use dbrx_tp_core::testing::{
    block_ids, max_abs_diff, prefill_slices, random_dbrx_weights, tiny_cache_config,
    tiny_dbrx_config,
};
use dbrx_tp_core::{BatchContext, BatchContextError, DbrxModel, Error, SequenceSlice};

const TOL: f32 = 1e-4;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn model() -> DbrxModel {
    let cfg = tiny_dbrx_config();
    let mut weights = random_dbrx_weights(&cfg, 42, &Device::Cpu).unwrap();
    let mut model = DbrxModel::load(
        &cfg,
        &mut weights,
        Arc::new(LocalCommunicator::new()),
        ExpertShardPolicy::default(),
    )
    .unwrap();
    model.repack_experts().unwrap();
    model
}

fn fresh_caches(model: &DbrxModel) -> KvCaches {
    KvCaches::new(&tiny_cache_config(model.config(), 1)).unwrap()
}

fn block_size(model: &DbrxModel) -> usize {
    tiny_cache_config(model.config(), 1).block_size
}

fn token_ids(n: usize, offset: u32) -> Vec<u32> {
    (0..n as u32).map(|i| (i * 7 + offset) % 64).collect()
}

fn ids_tensor(ids: &[u32]) -> Tensor {
    Tensor::new(ids, &Device::Cpu).unwrap()
}

fn cache_abs_sum(caches: &KvCaches) -> f32 {
    let mut total = 0.0;
    for layer in 0..caches.num_layers() {
        let cache = caches.layer(layer).unwrap();
        for t in [cache.key_cache(), cache.value_cache()] {
            let s: f32 = t.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
            total += s;
        }
    }
    total
}

// ─── Mixed-length batch ──────────────────────────────────────────────────────

#[test]
fn test_batched_rows_match_solo_runs() {
    let model = model();
    let lens = [5usize, 3, 7];
    let seq_ids: Vec<Vec<u32>> = lens
        .iter()
        .enumerate()
        .map(|(i, &n)| token_ids(n, i as u32 * 11))
        .collect();

    let ctx = BatchContext::from_sequences(&prefill_slices(&lens, block_size(&model))).unwrap();
    let mut caches = fresh_caches(&model);
    let batched = model.forward(&ids_tensor(&seq_ids.concat()), &ctx, &mut caches).unwrap();
    assert_eq!(batched.dims(), &[15, model.config().d_model]);

    let mut start = 0;
    for (ids, &len) in seq_ids.iter().zip(lens.iter()) {
        let solo_ctx =
            BatchContext::from_sequences(&prefill_slices(&[len], block_size(&model))).unwrap();
        let mut solo_caches = fresh_caches(&model);
        let solo = model.forward(&ids_tensor(ids), &solo_ctx, &mut solo_caches).unwrap();

        let rows = batched.i(start..start + len).unwrap();
        let diff = max_abs_diff(&rows, &solo).unwrap();
        assert!(diff < TOL, "sequence at {start}: diff {diff}");
        start += len;
    }
}

#[test]
fn test_prefill_then_decode_matches_full_prefill() {
    let model = model();
    let bs = block_size(&model);
    let ids = token_ids(6, 3);

    let full_ctx = BatchContext::from_sequences(&prefill_slices(&[6], bs)).unwrap();
    let mut full_caches = fresh_caches(&model);
    let full = model.forward(&ids_tensor(&ids), &full_ctx, &mut full_caches).unwrap();

    // Five tokens, then one decode step over the cached history
    let mut caches = fresh_caches(&model);
    let prefill_ctx =
        BatchContext::from_sequences(&[SequenceSlice::prefill(5, block_ids(0, 5, bs))]).unwrap();
    model.forward(&ids_tensor(&ids[..5]), &prefill_ctx, &mut caches).unwrap();

    let decode_ctx =
        BatchContext::from_sequences(&[SequenceSlice::new(5, 1, block_ids(0, 6, bs))]).unwrap();
    assert_eq!(decode_ctx.position_ids(), &[5]);
    let decoded = model.forward(&ids_tensor(&ids[5..]), &decode_ctx, &mut caches).unwrap();

    let diff = max_abs_diff(&decoded, &full.i(5..6).unwrap()).unwrap();
    assert!(diff < TOL, "decode diff {diff}");
}

#[test]
fn test_decode_and_prefill_share_a_batch() {
    let model = model();
    let bs = block_size(&model);
    let a = token_ids(4, 1);
    let b = token_ids(3, 9);

    let mut caches = fresh_caches(&model);
    let prime = BatchContext::from_sequences(&[SequenceSlice::prefill(3, block_ids(0, 3, bs))]).unwrap();
    model.forward(&ids_tensor(&a[..3]), &prime, &mut caches).unwrap();

    // A decodes its 4th token while B prefills into its own blocks
    let ctx = BatchContext::from_sequences(&[
        SequenceSlice::new(3, 1, block_ids(0, 4, bs)),
        SequenceSlice::prefill(3, block_ids(1, 3, bs)),
    ])
    .unwrap();
    let input: Vec<u32> = [&a[3..], &b[..]].concat();
    let out = model.forward(&ids_tensor(&input), &ctx, &mut caches).unwrap();
    assert_eq!(out.dims(), &[4, model.config().d_model]);

    let solo_a_ctx = BatchContext::from_sequences(&prefill_slices(&[4], bs)).unwrap();
    let mut solo_caches = fresh_caches(&model);
    let solo_a = model.forward(&ids_tensor(&a), &solo_a_ctx, &mut solo_caches).unwrap();
    let diff = max_abs_diff(&out.i(0..1).unwrap(), &solo_a.i(3..4).unwrap()).unwrap();
    assert!(diff < TOL, "decode row diff {diff}");

    let solo_b_ctx = BatchContext::from_sequences(&prefill_slices(&[3], bs)).unwrap();
    let mut solo_caches = fresh_caches(&model);
    let solo_b = model.forward(&ids_tensor(&b), &solo_b_ctx, &mut solo_caches).unwrap();
    let diff = max_abs_diff(&out.i(1..4).unwrap(), &solo_b).unwrap();
    assert!(diff < TOL, "prefill rows diff {diff}");
}

// ─── Malformed contexts ──────────────────────────────────────────────────────

#[test]
fn test_inconsistent_arrays_rejected_at_construction() {
    let err = BatchContext::new(
        vec![0, 3],
        vec![3],
        vec![3],
        vec![vec![0]],
        vec![0, 1, 2],
    )
    .unwrap_err();
    assert!(matches!(err, BatchContextError::LengthMismatch { field: "q_start_loc", .. }));

    let err = BatchContext::new(vec![0], vec![3], vec![2], vec![vec![0]], vec![0, 1, 2]).unwrap_err();
    assert!(matches!(err, BatchContextError::KvShorterThanQuery { .. }));
}

#[test]
fn test_token_count_mismatch_leaves_cache_untouched() {
    let model = model();
    let ctx = BatchContext::from_sequences(&prefill_slices(&[4, 2], block_size(&model))).unwrap();
    let mut caches = fresh_caches(&model);

    let err = model.forward(&ids_tensor(&token_ids(5, 0)), &ctx, &mut caches).unwrap_err();
    assert!(matches!(
        err,
        Error::BatchContext(BatchContextError::TokenCountMismatch { expected: 6, actual: 5 })
    ));
    assert_eq!(cache_abs_sum(&caches), 0.0);
}

#[test]
fn test_out_of_range_block_leaves_cache_untouched() {
    let model = model();
    let num_blocks = tiny_cache_config(model.config(), 1).num_blocks as u32;
    let ctx = BatchContext::from_sequences(&[
        SequenceSlice::prefill(2, vec![0]),
        SequenceSlice::prefill(2, vec![num_blocks]),
    ])
    .unwrap();
    let mut caches = fresh_caches(&model);

    let err = model.forward(&ids_tensor(&token_ids(4, 0)), &ctx, &mut caches).unwrap_err();
    assert!(matches!(
        err,
        Error::BatchContext(BatchContextError::BlockOutOfRange { seq: 1, .. })
    ));
    assert_eq!(cache_abs_sum(&caches), 0.0);
}

#[test]
fn test_too_few_blocks_leaves_cache_untouched() {
    let model = model();
    let ctx = BatchContext::from_sequences(&[SequenceSlice::prefill(6, vec![0])]).unwrap();
    let mut caches = fresh_caches(&model);

    let err = model.forward(&ids_tensor(&token_ids(6, 0)), &ctx, &mut caches).unwrap_err();
    assert!(matches!(
        err,
        Error::BatchContext(BatchContextError::InsufficientBlocks { seq: 0, .. })
    ));
    assert_eq!(cache_abs_sum(&caches), 0.0);
}
