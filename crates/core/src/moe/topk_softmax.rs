//! Fused top-k softmax for MoE routing.
//!
//! ## Algorithm
//!
//! 1. Compute softmax over expert logits in `f32`
//! 2. Select top-k experts by probability (ties go to the lower expert id)
//! 3. Optionally renormalize weights to sum to 1

use candle_core::{DType, Tensor, D};

use crate::error::{ensure, Result};

/// Select the `top_k` experts per token from raw gate logits.
///
/// # Arguments
/// * `gating_output` - Shape `[num_tokens, num_experts]`, raw logits from the gate
/// * `top_k` - Experts per token
/// * `renormalize` - Rescale the selected weights to sum to 1
///
/// # Returns
/// * `(weights F32 [num_tokens, top_k], ids U32 [num_tokens, top_k])`, ordered
///   by descending weight
pub fn fused_topk(gating_output: &Tensor, top_k: usize, renormalize: bool) -> Result<(Tensor, Tensor)> {
    let (_num_tokens, num_experts) = gating_output.dims2()?;
    ensure!(top_k > 0, "top_k must be > 0");
    ensure!(
        top_k <= num_experts,
        "top_k ({top_k}) cannot be greater than num_experts ({num_experts})"
    );

    let probs = candle_nn::ops::softmax(&gating_output.to_dtype(DType::F32)?, D::Minus1)?;

    // Descending; candle's arg sort is stable so equal scores keep index order.
    let sorted = probs.arg_sort_last_dim(false)?;
    let topk_ids = sorted.narrow(1, 0, top_k)?.contiguous()?;
    let topk_weights = probs.contiguous()?.gather(&topk_ids, 1)?;

    let topk_weights = if renormalize {
        let sum = topk_weights.sum_keepdim(1)?;
        topk_weights.broadcast_div(&sum)?
    } else {
        topk_weights
    };

    Ok((topk_weights, topk_ids.to_dtype(DType::U32)?))
}
