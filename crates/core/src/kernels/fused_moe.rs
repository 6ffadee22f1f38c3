//! Fused expert computation.
//!
//! CPU implementation of the grouped pattern: tokens are grouped by expert,
//! each expert runs once over its batch, and the weighted results are
//! scattered back with `index_add`.

use candle_core::{DType, IndexOp, Tensor};

use super::error::{KernelError, KernelResultExt};

const KERNEL: &str = "fused_moe";

/// `Σ_k w[t,k] · down[e_k] · (silu(gate[e_k] · x_t) ⊙ (value[e_k] · x_t))`
///
/// - `hidden_states`: `[tokens, hidden]`
/// - `gate_up`: `[experts, 2 * ffn, hidden]`, gate rows first
/// - `down_t`: `[experts, hidden, ffn]`
/// - `top_weights`: `[tokens, topk]`
/// - `top_experts`: `[tokens, topk]` (u32); ids `>= experts` are skipped
///
/// With `renormalize`, each token's weights are divided by their sum first.
pub fn fused_moe(
    hidden_states: &Tensor,
    gate_up: &Tensor,
    down_t: &Tensor,
    top_weights: &Tensor,
    top_experts: &Tensor,
    topk: usize,
    renormalize: bool,
) -> Result<Tensor, KernelError> {
    let (num_tokens, hidden) = hidden_states.dims2().in_kernel(KERNEL)?;
    let (num_experts, two_ffn, gu_hidden) = gate_up.dims3().in_kernel(KERNEL)?;
    let (down_experts, down_hidden, ffn) = down_t.dims3().in_kernel(KERNEL)?;
    if gu_hidden != hidden || down_hidden != hidden || two_ffn != 2 * ffn || down_experts != num_experts {
        return Err(KernelError::invalid(
            KERNEL,
            format!(
                "weight shapes {:?} / {:?} do not fit hidden size {hidden}",
                gate_up.dims(),
                down_t.dims()
            ),
        ));
    }
    for (name, t) in [("top_weights", top_weights), ("top_experts", top_experts)] {
        if t.dims() != [num_tokens, topk] {
            return Err(KernelError::invalid(
                KERNEL,
                format!("{name} has shape {:?}, expected [{num_tokens}, {topk}]", t.dims()),
            ));
        }
    }

    grouped_forward(
        hidden_states,
        gate_up,
        down_t,
        top_weights,
        top_experts,
        topk,
        renormalize,
    )
    .in_kernel(KERNEL)
}

fn grouped_forward(
    hidden_states: &Tensor,
    gate_up: &Tensor,
    down_t: &Tensor,
    top_weights: &Tensor,
    top_experts: &Tensor,
    topk: usize,
    renormalize: bool,
) -> candle_core::Result<Tensor> {
    let device = hidden_states.device();
    let dtype = hidden_states.dtype();
    let (num_tokens, hidden) = hidden_states.dims2()?;
    let num_experts = gate_up.dim(0)?;
    let ffn = down_t.dim(2)?;

    let experts: Vec<u32> = top_experts.flatten_all()?.to_vec1()?;
    let mut weights: Vec<f32> = top_weights.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    if renormalize {
        for row in weights.chunks_mut(topk) {
            let sum: f32 = row.iter().sum();
            if sum > 0.0 {
                row.iter_mut().for_each(|w| *w /= sum);
            }
        }
    }

    // Group (token, weight) pairs by expert
    let mut per_expert: Vec<(Vec<u32>, Vec<f32>)> = vec![(Vec::new(), Vec::new()); num_experts];
    for (flat, (&e, &w)) in experts.iter().zip(&weights).enumerate() {
        if let Some((tokens, ws)) = per_expert.get_mut(e as usize) {
            tokens.push((flat / topk) as u32);
            ws.push(w);
        }
    }

    let mut output = Tensor::zeros((num_tokens, hidden), dtype, device)?;
    for (expert_id, (tokens, ws)) in per_expert.into_iter().enumerate() {
        if tokens.is_empty() {
            continue;
        }
        let n = tokens.len();
        let index = Tensor::from_vec(tokens, n, device)?;
        let xs = hidden_states.index_select(&index, 0)?;

        let gu = xs.matmul(&gate_up.i(expert_id)?.t()?)?;
        let gate = gu.narrow(1, 0, ffn)?;
        let value = gu.narrow(1, ffn, ffn)?;
        let act = (candle_nn::ops::silu(&gate)? * value)?;
        let ys = act.matmul(&down_t.i(expert_id)?.t()?)?;

        let ws = Tensor::from_vec(ws, (n, 1), device)?.to_dtype(dtype)?;
        output = output.index_add(&index, &ys.broadcast_mul(&ws)?, 0)?;
    }
    Ok(output)
}
