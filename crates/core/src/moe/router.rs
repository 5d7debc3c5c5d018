//! Token-to-expert routing.
//!
//! Two built-in strategies turn gate logits into `(topk_weights, topk_ids)`:
//! plain top-k over a softmax ([`fused_topk`]) and grouped top-k
//! ([`grouped_topk`]) which first restricts each token to its best expert
//! groups. A custom strategy can be plugged in through [`RoutingFunction`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Tensor, D};

use super::topk_softmax::fused_topk;
use crate::error::{ensure, MoeError, Result};

/// How raw gate logits become per-expert scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoringFunc {
    #[default]
    Softmax,
    Sigmoid,
}

impl FromStr for ScoringFunc {
    type Err = MoeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "softmax" => Ok(Self::Softmax),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(MoeError::PreconditionViolation(format!(
                "unsupported scoring function: {other}"
            ))),
        }
    }
}

impl fmt::Display for ScoringFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Softmax => write!(f, "softmax"),
            Self::Sigmoid => write!(f, "sigmoid"),
        }
    }
}

/// User-supplied routing strategy.
pub trait RoutingFunction: Send + Sync + fmt::Debug {
    /// Return `(topk_weights F32 [M, top_k], topk_ids U32 [M, top_k])`.
    fn route(
        &self,
        hidden_states: &Tensor,
        gating_output: &Tensor,
        top_k: usize,
        renormalize: bool,
    ) -> Result<(Tensor, Tensor)>;
}

/// Routing strategy selected by the model config.
#[derive(Debug, Clone, Default)]
pub enum RoutingMethod {
    /// Softmax then top-k.
    #[default]
    TopK,
    /// Group-restricted top-k with optional score-correction bias.
    GroupedTopK {
        num_expert_group: usize,
        topk_group: usize,
        scoring: ScoringFunc,
        e_score_correction_bias: Option<Tensor>,
    },
    Custom(Arc<dyn RoutingFunction>),
}

impl RoutingMethod {
    /// Route `hidden_states` (only its row count is used by the built-in
    /// strategies) given the gate logits `[M, E]`.
    pub fn route(
        &self,
        hidden_states: &Tensor,
        gating_output: &Tensor,
        top_k: usize,
        renormalize: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (tokens, _) = hidden_states.dims2()?;
        let (gate_rows, _) = gating_output.dims2()?;
        ensure!(
            tokens == gate_rows,
            "number of tokens mismatch: hidden states {tokens}, gating output {gate_rows}"
        );
        match self {
            Self::TopK => fused_topk(gating_output, top_k, renormalize),
            Self::GroupedTopK {
                num_expert_group,
                topk_group,
                scoring,
                e_score_correction_bias,
            } => grouped_topk(
                gating_output,
                top_k,
                renormalize,
                *num_expert_group,
                *topk_group,
                *scoring,
                e_score_correction_bias.as_ref(),
            ),
            Self::Custom(f) => f.route(hidden_states, gating_output, top_k, renormalize),
        }
    }
}

/// Indices of the `k` largest values, descending, ties to the lower index.
fn top_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}

/// Grouped top-k routing (DeepSeek-V2/V3 style).
///
/// Experts are split into `num_expert_group` contiguous groups. Each token
/// keeps its `topk_group` best groups, scored by the group max or, with a
/// correction bias, by the sum of the group's two best biased scores; then
/// picks `top_k` experts from the surviving groups. The bias only affects
/// selection: returned weights are the unbiased scores.
///
/// # Returns
/// `(topk_weights F32 [M, top_k], topk_ids U32 [M, top_k])`
pub fn grouped_topk(
    gating_output: &Tensor,
    top_k: usize,
    renormalize: bool,
    num_expert_group: usize,
    topk_group: usize,
    scoring: ScoringFunc,
    e_score_correction_bias: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let (num_tokens, num_experts) = gating_output.dims2()?;
    ensure!(
        num_expert_group > 0 && num_experts % num_expert_group == 0,
        "num_experts ({num_experts}) must be divisible by num_expert_group ({num_expert_group})"
    );
    ensure!(
        topk_group > 0 && topk_group <= num_expert_group,
        "topk_group ({topk_group}) must be in 1..={num_expert_group}"
    );
    let group_size = num_experts / num_expert_group;
    ensure!(
        top_k > 0 && top_k <= topk_group * group_size,
        "top_k ({top_k}) exceeds the {} experts in the selected groups",
        topk_group * group_size
    );

    let logits = gating_output.to_dtype(DType::F32)?;
    let scores = match scoring {
        ScoringFunc::Softmax => candle_nn::ops::softmax(&logits, D::Minus1)?,
        ScoringFunc::Sigmoid => candle_nn::ops::sigmoid(&logits)?,
    };
    let scores: Vec<Vec<f32>> = scores.to_vec2()?;
    let bias: Option<Vec<f32>> = match e_score_correction_bias {
        Some(b) => {
            ensure!(
                b.dims() == [num_experts],
                "e_score_correction_bias must have shape [{num_experts}], got {:?}",
                b.dims()
            );
            Some(b.to_dtype(DType::F32)?.to_vec1()?)
        }
        None => None,
    };

    let mut weights = Vec::with_capacity(num_tokens * top_k);
    let mut ids = Vec::with_capacity(num_tokens * top_k);
    for row in &scores {
        let biased: Vec<f32> = match &bias {
            Some(b) => row.iter().zip(b).map(|(s, b)| s + b).collect(),
            None => row.clone(),
        };

        let group_scores: Vec<f32> = biased
            .chunks(group_size)
            .map(|g| {
                if bias.is_some() {
                    top_indices(g, 2).into_iter().map(|i| g[i]).sum()
                } else {
                    g.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
                }
            })
            .collect();
        let mut keep = vec![false; num_expert_group];
        for g in top_indices(&group_scores, topk_group) {
            keep[g] = true;
        }

        let masked: Vec<f32> = biased
            .iter()
            .enumerate()
            .map(|(e, &s)| if keep[e / group_size] { s } else { f32::NEG_INFINITY })
            .collect();
        let selected = top_indices(&masked, top_k);

        // the unbiased score is the routing weight either way
        let mut w: Vec<f32> = selected.iter().map(|&e| row[e]).collect();
        if renormalize {
            let sum: f32 = w.iter().sum();
            w.iter_mut().for_each(|v| *v /= sum);
        }
        weights.extend(w);
        ids.extend(selected.into_iter().map(|e| e as u32));
    }

    let device = gating_output.device();
    Ok((
        Tensor::from_vec(weights, (num_tokens, top_k), device)?,
        Tensor::from_vec(ids, (num_tokens, top_k), device)?,
    ))
}
