//! Per-precision accumulation strategies for one output tile.
//!
//! The tile skeleton in the parent module loads raw activation and weight
//! values one K step at a time; a [`DequantAccumulate`] decides where the
//! scales enter the sum.

use std::ops::Range;

use candle_core::DType;

use crate::quantization::{BlockShape, ExpertWeights, QuantizedActivation};

/// Everything a strategy needs to know about the tile being computed.
pub(crate) struct TileContext<'a> {
    pub a: &'a QuantizedActivation,
    pub b: &'a ExpertWeights,
    pub expert: usize,
    /// Activation row per tile row, `None` for padding rows.
    pub a_rows: &'a [Option<usize>],
    /// Output columns covered by the tile.
    pub cols: Range<usize>,
    pub compute_dtype: DType,
}

/// One K step of a tile: `a_tile` is `[block_m, block_k]`, `b_tile` is
/// `[cols.len(), block_k]`, both raw (undequantized) values. Only the first
/// `k_valid` entries of each row are inside K.
pub(crate) struct KStep<'a> {
    pub k_start: usize,
    pub k_valid: usize,
    pub block_k: usize,
    pub a_tile: &'a [f32],
    pub b_tile: &'a [f32],
}

pub(crate) trait DequantAccumulate: Sync {
    /// Add one K step into `acc` (`[block_m, cols.len()]`, f32).
    fn step(&self, ctx: &TileContext<'_>, step: &KStep<'_>, acc: &mut [f32]);

    /// Applied once after the K loop.
    fn finish(&self, _ctx: &TileContext<'_>, _acc: &mut [f32]) {}
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Round to the compute dtype and back.
#[inline]
pub(crate) fn round_to(dtype: DType, v: f32) -> f32 {
    match dtype {
        DType::F16 => half::f16::from_f32(v).to_f32(),
        DType::BF16 => half::bf16::from_f32(v).to_f32(),
        _ => v,
    }
}

/// Visit every `(tile row, activation row, column)` triple with the raw dot
/// product over the valid part of the step.
#[inline]
fn for_each_product(
    ctx: &TileContext<'_>,
    step: &KStep<'_>,
    mut f: impl FnMut(usize, usize, usize, f32),
) {
    let bk = step.block_k;
    let kv = step.k_valid;
    for (r, a_row) in ctx.a_rows.iter().enumerate() {
        let Some(a_row) = *a_row else { continue };
        let a = &step.a_tile[r * bk..r * bk + kv];
        for c in 0..ctx.cols.len() {
            let b = &step.b_tile[c * bk..c * bk + kv];
            f(r, a_row, c, dot(a, b));
        }
    }
}

/// Full precision: plain dot products.
pub(crate) struct PlainAccumulate;

impl DequantAccumulate for PlainAccumulate {
    fn step(&self, ctx: &TileContext<'_>, step: &KStep<'_>, acc: &mut [f32]) {
        let width = ctx.cols.len();
        for_each_product(ctx, step, |r, _, c, p| acc[r * width + c] += p);
    }
}

/// Tensor- or channel-wise FP8/INT8: raw products accumulate, both scales
/// are applied once at the end.
pub(crate) struct PostScaledAccumulate {
    pub per_channel: bool,
}

impl DequantAccumulate for PostScaledAccumulate {
    fn step(&self, ctx: &TileContext<'_>, step: &KStep<'_>, acc: &mut [f32]) {
        let width = ctx.cols.len();
        for_each_product(ctx, step, |r, _, c, p| acc[r * width + c] += p);
    }

    fn finish(&self, ctx: &TileContext<'_>, acc: &mut [f32]) {
        let Some(b_scale) = ctx.b.scale() else {
            return;
        };
        let width = ctx.cols.len();
        for (r, a_row) in ctx.a_rows.iter().enumerate() {
            let Some(a_row) = *a_row else { continue };
            let a_scale = ctx.a.scale_at(a_row, 0);
            for (c, col) in ctx.cols.clone().enumerate() {
                let w_scale = if self.per_channel {
                    b_scale.at2(ctx.expert, col)
                } else {
                    b_scale.at1(ctx.expert)
                };
                acc[r * width + c] *= a_scale * w_scale;
            }
        }
    }
}

/// Block-wise FP8/INT8: each K step lies inside one `block_k` scale block
/// and is scaled before it is added.
pub(crate) struct BlockScaledAccumulate {
    pub shape: BlockShape,
}

impl DequantAccumulate for BlockScaledAccumulate {
    fn step(&self, ctx: &TileContext<'_>, step: &KStep<'_>, acc: &mut [f32]) {
        let Some(b_scale) = ctx.b.scale() else {
            return;
        };
        let width = ctx.cols.len();
        let k_block = step.k_start / self.shape.block_k;
        let col0 = ctx.cols.start;
        for_each_product(ctx, step, |r, a_row, c, p| {
            let a_scale = ctx.a.scale_at(a_row, step.k_start);
            let w_scale = b_scale.at3(ctx.expert, (col0 + c) / self.shape.block_n, k_block);
            acc[r * width + c] += p * a_scale * w_scale;
        });
    }
}

/// 4/8-bit weight-only: weights are dequantized per element with their
/// group scale and zero point, cast to the compute dtype, then multiplied
/// with the unquantized activations.
pub(crate) struct WeightOnlyAccumulate {
    pub group_size: usize,
}

impl DequantAccumulate for WeightOnlyAccumulate {
    fn step(&self, ctx: &TileContext<'_>, step: &KStep<'_>, acc: &mut [f32]) {
        let Some(b_scale) = ctx.b.scale() else {
            return;
        };
        let bk = step.block_k;
        let kv = step.k_valid;
        let width = ctx.cols.len();

        let mut w = vec![0f32; width * kv];
        for (c, col) in ctx.cols.clone().enumerate() {
            for kk in 0..kv {
                let k = step.k_start + kk;
                let group = k / self.group_size;
                let q = step.b_tile[c * bk + kk];
                let zp = ctx.b.zero_at(ctx.expert, col, group);
                let v = (q - zp) * b_scale.at3(ctx.expert, col, group);
                w[c * kv + kk] = round_to(ctx.compute_dtype, v);
            }
        }

        for (r, a_row) in ctx.a_rows.iter().enumerate() {
            if a_row.is_none() {
                continue;
            }
            let a = &step.a_tile[r * bk..r * bk + kv];
            for c in 0..width {
                acc[r * width + c] += dot(a, &w[c * kv..(c + 1) * kv]);
            }
        }
    }
}
