//! Fused MoE forward: route, then per chunk
//! quantize -> align -> GEMM1 -> gated activation -> quantize -> GEMM2 -> slot sum.

use candle_core::{DType, Tensor};
use tracing::debug;

use super::activation::Activation;
use super::config_cache::MoeConfigCache;
use super::kernel::{invoke_fused_moe_kernel, MoeGemmArgs};
use super::reduce::moe_sum_into;
use super::scratch::ScratchArena;
use super::token_grouper::MoeTokenGrouper;
use crate::error::{ensure, MoeError, Result};
use crate::moe::expert_map::ExpertMap;
use crate::moe::router::RoutingMethod;
use crate::quantization::{prepare_activation, ExpertWeights, ScaleTensor};

/// Tokens processed per chunk unless overridden.
pub const DEFAULT_CHUNK_SIZE: usize = 32768;

/// Per-call options of the fused MoE forward.
#[derive(Debug, Clone)]
pub struct FusedMoeParams {
    pub activation: Activation,
    /// Multiply GEMM1 outputs by the routing weight instead of GEMM2 outputs.
    pub apply_router_weight_on_input: bool,
    /// Global expert count; defaults to the expert count of `w1`.
    pub global_num_experts: Option<usize>,
    /// Global -> local expert mapping when experts are sharded.
    pub expert_map: Option<ExpertMap>,
    /// Static activation scale for GEMM1 (per tensor or per token).
    pub a1_scale: Option<ScaleTensor>,
    /// Static activation scale for GEMM2 (per tensor or per `(token, slot)`).
    pub a2_scale: Option<ScaleTensor>,
    pub chunk_size: usize,
}

impl Default for FusedMoeParams {
    fn default() -> Self {
        Self {
            activation: Activation::Silu,
            apply_router_weight_on_input: false,
            global_num_experts: None,
            expert_map: None,
            a1_scale: None,
            a2_scale: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Where the routing assignment comes from.
#[derive(Debug, Clone, Copy)]
pub enum RoutingInput<'a> {
    /// Route the gate logits `[M, E]` with `method`.
    GatingOutput {
        gating_output: &'a Tensor,
        method: &'a RoutingMethod,
        top_k: usize,
        renormalize: bool,
    },
    /// Routing already computed upstream.
    Precomputed {
        topk_weights: &'a Tensor,
        topk_ids: &'a Tensor,
    },
}

/// Full MoE feed-forward for `hidden_states` `[M, K]`.
///
/// `w1` is the stacked gate/up projection `(E, N, K)`, `w2` the down
/// projection `(E, K, N / 2)`. Returns a tensor with the shape and dtype of
/// `hidden_states`.
pub fn fused_moe(
    hidden_states: &Tensor,
    w1: &ExpertWeights,
    w2: &ExpertWeights,
    routing: RoutingInput<'_>,
    params: &FusedMoeParams,
    configs: &MoeConfigCache,
) -> Result<Tensor> {
    match routing {
        RoutingInput::GatingOutput {
            gating_output,
            method,
            top_k,
            renormalize,
        } => {
            let (topk_weights, topk_ids) =
                method.route(hidden_states, gating_output, top_k, renormalize)?;
            fused_experts(hidden_states, w1, w2, &topk_weights, &topk_ids, params, configs)
        }
        RoutingInput::Precomputed {
            topk_weights,
            topk_ids,
        } => fused_experts(hidden_states, w1, w2, topk_weights, topk_ids, params, configs),
    }
}

/// Expert computation for an existing routing assignment.
///
/// # Arguments
/// * `topk_weights` - `[M, top_k]` routing weights
/// * `topk_ids` - `[M, top_k]` global expert ids
pub fn fused_experts(
    hidden_states: &Tensor,
    w1: &ExpertWeights,
    w2: &ExpertWeights,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
    params: &FusedMoeParams,
    configs: &MoeConfigCache,
) -> Result<Tensor> {
    let problem = Problem::validate(hidden_states, w1, w2, topk_weights, topk_ids, params)?;
    let Problem {
        num_tokens,
        hidden_size: k,
        n,
        top_k,
        global_num_experts,
        compute_dtype,
    } = problem;

    let mode = w1.mode();
    let config_dtype = mode.config_dtype_str(compute_dtype);
    let block_shape = mode.block_shape();

    if num_tokens == 0 {
        return Ok(Tensor::zeros(
            hidden_states.shape(),
            compute_dtype,
            hidden_states.device(),
        )?);
    }

    let hidden: Vec<f32> = hidden_states.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let weights: Vec<f32> = topk_weights.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let ids: Vec<u32> = topk_ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= global_num_experts) {
        return Err(MoeError::PreconditionViolation(format!(
            "expert id {bad} out of range for {global_num_experts} experts"
        )));
    }

    let chunk_size = params.chunk_size.max(1);
    let m = num_tokens.min(chunk_size);
    let select = |tokens: usize| {
        configs.try_get_optimal(w1.dims(), w2.dims(), top_k, config_dtype, tokens, block_shape)
    };
    let mut config = select(m)?;

    let mut scratch = ScratchArena::new(m * top_k, n, k);
    let mut output = vec![0f32; num_tokens * k];

    for chunk in 0..=(num_tokens / chunk_size) {
        let begin = chunk * chunk_size;
        let end = ((chunk + 1) * chunk_size).min(num_tokens);
        if end <= begin {
            break;
        }
        let tokens = end - begin;
        if tokens < chunk_size && chunk > 0 {
            config = select(tokens)?;
        }
        let pairs = tokens * top_k;
        let chunk_weights = &weights[begin * top_k..end * top_k];
        let chunk_ids = &ids[begin * top_k..end * top_k];

        let a1 = prepare_activation(
            hidden[begin * k..end * k].to_vec(),
            tokens,
            k,
            chunk_scale(params.a1_scale.as_ref(), num_tokens, begin, end)?.as_ref(),
            &w1.mode(),
        )?;

        let permutation = MoeTokenGrouper::new(config.block_size_m, global_num_experts)
            .align_ids(chunk_ids, params.expert_map.as_ref())?;
        debug!(
            chunk,
            tokens,
            block_size_m = config.block_size_m,
            block_size_n = ?config.block_size_n,
            block_size_k = ?config.block_size_k,
            num_tokens_post_padded = permutation.num_tokens_post_padded,
            "Launching fused MoE chunk"
        );

        let gemm1 = MoeGemmArgs {
            a: &a1,
            b: w1,
            topk_weights: Some(chunk_weights),
            permutation: &permutation,
            mul_routed_weight: params.apply_router_weight_on_input,
            top_k,
            config: &config,
            compute_dtype,
        };
        invoke_fused_moe_kernel(&gemm1, scratch.gemm1_output(pairs))?;

        let (gate_up, activated) = scratch.activation_io(pairs);
        params
            .activation
            .apply_and_mul_into(gate_up, n, compute_dtype, activated)?;

        let a2 = prepare_activation(
            scratch.activation_output(pairs).to_vec(),
            pairs,
            n / 2,
            chunk_scale(
                params.a2_scale.as_ref(),
                num_tokens * top_k,
                begin * top_k,
                end * top_k,
            )?
            .as_ref(),
            &w2.mode(),
        )?;

        let gemm2 = MoeGemmArgs {
            a: &a2,
            b: w2,
            topk_weights: Some(chunk_weights),
            permutation: &permutation,
            mul_routed_weight: !params.apply_router_weight_on_input,
            top_k: 1,
            config: &config,
            compute_dtype,
        };
        let down = scratch.gemm2_output(pairs);
        invoke_fused_moe_kernel(&gemm2, down)?;

        moe_sum_into(down, top_k, k, compute_dtype, &mut output[begin * k..end * k])?;
    }

    Ok(Tensor::from_vec(output, (num_tokens, k), hidden_states.device())?.to_dtype(compute_dtype)?)
}

/// Static scale rows belonging to `[begin, end)`; per-tensor scales are
/// shared by every chunk.
fn chunk_scale(
    scale: Option<&ScaleTensor>,
    total_rows: usize,
    begin: usize,
    end: usize,
) -> Result<Option<ScaleTensor>> {
    let Some(scale) = scale else {
        return Ok(None);
    };
    if scale.values().len() == 1 || (begin == 0 && end == total_rows) {
        return Ok(Some(scale.clone()));
    }
    let dims = scale.dims();
    ensure!(
        dims.first() == Some(&total_rows),
        "activation scale shape {dims:?} does not match {total_rows} rows"
    );
    let per_row = scale.values().len() / total_rows;
    let mut chunk_dims = dims.to_vec();
    chunk_dims[0] = end - begin;
    ScaleTensor::new(
        chunk_dims,
        scale.values()[begin * per_row..end * per_row].to_vec(),
    )
    .map(Some)
}

/// Validated dimensions of one forward call.
#[derive(Debug, Clone, Copy)]
struct Problem {
    num_tokens: usize,
    hidden_size: usize,
    n: usize,
    top_k: usize,
    global_num_experts: usize,
    compute_dtype: DType,
}

impl Problem {
    fn validate(
        hidden_states: &Tensor,
        w1: &ExpertWeights,
        w2: &ExpertWeights,
        topk_weights: &Tensor,
        topk_ids: &Tensor,
        params: &FusedMoeParams,
    ) -> Result<Self> {
        ensure!(
            hidden_states.rank() == 2,
            "hidden states must be [num_tokens, hidden_size], got {:?}",
            hidden_states.dims()
        );
        let (num_tokens, hidden_size) = hidden_states.dims2()?;
        ensure!(
            hidden_states.is_contiguous(),
            "hidden states must be contiguous"
        );
        let compute_dtype = hidden_states.dtype();
        ensure!(
            matches!(compute_dtype, DType::F32 | DType::F16 | DType::BF16),
            "unsupported compute dtype {compute_dtype:?}"
        );

        let (e1, n, k1) = w1.dims();
        let (e2, k2, n2) = w2.dims();
        ensure!(
            hidden_size == k1,
            "hidden size mismatch: hidden states {hidden_size}, w1 K {k1}"
        );
        ensure!(n % 2 == 0, "w1 N must be even for the gated activation, got {n}");
        ensure!(
            n2 == n / 2,
            "w2 K ({n2}) must be half of w1 N ({n})"
        );
        ensure!(
            k2 == hidden_size,
            "w2 N ({k2}) must equal the hidden size ({hidden_size})"
        );
        ensure!(e1 == e2, "w1 has {e1} experts but w2 has {e2}");
        if !w1.mode().same_family(&w2.mode()) {
            return Err(MoeError::UnsupportedQuantization(format!(
                "w1 ({}) and w2 ({}) use different quantization modes",
                w1.mode(),
                w2.mode()
            )));
        }

        ensure!(
            topk_weights.dims() == topk_ids.dims(),
            "topk shape mismatch: weights {:?}, ids {:?}",
            topk_weights.dims(),
            topk_ids.dims()
        );
        let (routed_tokens, top_k) = topk_ids.dims2()?;
        ensure!(
            routed_tokens == num_tokens,
            "routing covers {routed_tokens} tokens, hidden states have {num_tokens}"
        );
        ensure!(top_k > 0, "top_k must be > 0");

        let global_num_experts = params.global_num_experts.unwrap_or(e1);
        match &params.expert_map {
            Some(map) => {
                ensure!(
                    map.num_experts() == global_num_experts,
                    "expert map covers {} experts, expected {global_num_experts}",
                    map.num_experts()
                );
                ensure!(
                    map.local_num_experts() == e1,
                    "expert map has {} local experts but the weights hold {e1}",
                    map.local_num_experts()
                );
            }
            None => ensure!(
                global_num_experts == e1,
                "global expert count {global_num_experts} differs from the {e1} stored experts; an expert map is required"
            ),
        }
        ensure!(
            top_k <= global_num_experts,
            "top_k ({top_k}) cannot be greater than num_experts ({global_num_experts})"
        );

        Ok(Self {
            num_tokens,
            hidden_size,
            n,
            top_k,
            global_num_experts,
            compute_dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moe::topk_softmax::fused_topk;
    use candle_core::Device;

    fn weights(e: usize, n: usize, k: usize, seed: u64) -> Tensor {
        let mut s = seed;
        let v: Vec<f32> = (0..e * n * k)
            .map(|_| {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((s >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 0.5
            })
            .collect();
        Tensor::from_vec(v, (e, n, k), &Device::Cpu).unwrap()
    }

    fn setup() -> (Tensor, ExpertWeights, ExpertWeights, Tensor) {
        let (e, n, k, m) = (4, 8, 6, 5);
        let hidden = weights(1, m, k, 1).squeeze(0).unwrap();
        let w1 = ExpertWeights::full(&weights(e, n, k, 2)).unwrap();
        let w2 = ExpertWeights::full(&weights(e, k, n / 2, 3)).unwrap();
        let gating = weights(1, m, e, 4).squeeze(0).unwrap();
        (hidden, w1, w2, gating)
    }

    #[test]
    fn test_output_shape_and_dtype() {
        let (hidden, w1, w2, gating) = setup();
        let out = fused_moe(
            &hidden,
            &w1,
            &w2,
            RoutingInput::GatingOutput {
                gating_output: &gating,
                method: &RoutingMethod::TopK,
                top_k: 2,
                renormalize: true,
            },
            &FusedMoeParams::default(),
            &MoeConfigCache::heuristic_only(),
        )
        .unwrap();
        assert_eq!(out.dims(), hidden.dims());
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn test_chunking_matches_single_chunk() {
        let (hidden, w1, w2, gating) = setup();
        let (tw, ti) = fused_topk(&gating, 2, true).unwrap();
        let configs = MoeConfigCache::heuristic_only();
        let whole = fused_experts(&hidden, &w1, &w2, &tw, &ti, &FusedMoeParams::default(), &configs)
            .unwrap();
        let params = FusedMoeParams {
            chunk_size: 2,
            ..Default::default()
        };
        let chunked = fused_experts(&hidden, &w1, &w2, &tw, &ti, &params, &configs).unwrap();
        let diff = (whole - chunked)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "chunked output differs by {diff}");
    }

    #[test]
    fn test_empty_batch() {
        let (_, w1, w2, _) = setup();
        let hidden = Tensor::zeros((0, 6), DType::F32, &Device::Cpu).unwrap();
        let ids = Tensor::zeros((0, 2), DType::U32, &Device::Cpu).unwrap();
        let tw = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        let out = fused_experts(
            &hidden,
            &w1,
            &w2,
            &tw,
            &ids,
            &FusedMoeParams::default(),
            &MoeConfigCache::heuristic_only(),
        )
        .unwrap();
        assert_eq!(out.dims(), &[0, 6]);
    }

    #[test]
    fn test_preconditions() {
        let (hidden, w1, w2, gating) = setup();
        let (tw, ti) = fused_topk(&gating, 2, true).unwrap();
        let configs = MoeConfigCache::heuristic_only();
        let params = FusedMoeParams::default();

        // hidden size mismatch
        let bad_hidden = Tensor::zeros((5, 7), DType::F32, &Device::Cpu).unwrap();
        let err = fused_experts(&bad_hidden, &w1, &w2, &tw, &ti, &params, &configs).unwrap_err();
        assert!(matches!(err, MoeError::PreconditionViolation(_)));

        // unsupported compute dtype
        let f64_hidden = hidden.to_dtype(DType::F64).unwrap();
        let err = fused_experts(&f64_hidden, &w1, &w2, &tw, &ti, &params, &configs).unwrap_err();
        assert!(err.to_string().contains("unsupported compute dtype"));

        // topk shape mismatch
        let tw3 = Tensor::zeros((5, 3), DType::F32, &Device::Cpu).unwrap();
        let err = fused_experts(&hidden, &w1, &w2, &tw3, &ti, &params, &configs).unwrap_err();
        assert!(err.to_string().contains("topk shape mismatch"));

        // non-contiguous hidden states
        let wide = Tensor::zeros((5, 12), DType::F32, &Device::Cpu).unwrap();
        let strided = wide.narrow(1, 0, 6).unwrap();
        let err = fused_experts(&strided, &w1, &w2, &tw, &ti, &params, &configs).unwrap_err();
        assert!(err.to_string().contains("contiguous"));

        // swapped weights
        let err = fused_experts(&hidden, &w2, &w1, &tw, &ti, &params, &configs).unwrap_err();
        assert!(matches!(err, MoeError::PreconditionViolation(_)));
    }

    #[test]
    fn test_chunk_scale_slices_rows() {
        let scale = ScaleTensor::new(vec![4, 1], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let sliced = chunk_scale(Some(&scale), 4, 1, 3).unwrap().unwrap();
        assert_eq!(sliced.dims(), &[2, 1]);
        assert_eq!(sliced.values(), &[2.0, 3.0]);

        let scalar = ScaleTensor::scalar(0.5);
        let same = chunk_scale(Some(&scalar), 4, 1, 3).unwrap().unwrap();
        assert_eq!(same.values(), &[0.5]);
        assert!(chunk_scale(None, 4, 0, 4).unwrap().is_none());
    }
}
