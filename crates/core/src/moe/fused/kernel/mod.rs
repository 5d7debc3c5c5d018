//! Grouped GEMM over expert-sorted token tiles.
//!
//! One launch multiplies every valid `(token, slot)` row of the sorted
//! permutation with the weight matrix of the expert owning its row block:
//!
//! ```text
//! C[pair, n] = sum_k A[pair / top_k, k] * B[expert(pair), n, k]
//! ```
//!
//! The grid is `cdiv(EM, BLOCK_M) * cdiv(N, BLOCK_N)` tiles in grouped
//! order. Tiles run in parallel with rayon; each produces a [`TileOutput`]
//! that is scattered into `C` afterwards (tiles never share an output cell).

mod accumulate;

use candle_core::DType;
use rayon::prelude::*;

pub(crate) use self::accumulate::round_to;
use self::accumulate::{
    BlockScaledAccumulate, DequantAccumulate, KStep, PlainAccumulate, PostScaledAccumulate,
    TileContext, WeightOnlyAccumulate,
};
use super::config::{GemmDims, KernelConfig, TileShape};
use super::token_grouper::SortedTokenPermutation;
use crate::error::{ensure, MoeError, Result};
use crate::moe::expert_map::ExpertSlot;
use crate::quantization::{ExpertWeights, QuantMode, QuantizedActivation};

/// Inputs of one grouped GEMM launch.
#[derive(Debug, Clone, Copy)]
pub struct MoeGemmArgs<'a> {
    /// `[rows, K]` activations; row of pair `p` is `p / top_k`.
    pub a: &'a QuantizedActivation,
    /// `(E, N, K)` expert weights.
    pub b: &'a ExpertWeights,
    /// Flat `[M * top_k]` routing weights, required with `mul_routed_weight`.
    pub topk_weights: Option<&'a [f32]>,
    pub permutation: &'a SortedTokenPermutation,
    pub mul_routed_weight: bool,
    pub top_k: usize,
    pub config: &'a KernelConfig,
    /// Output precision; results are rounded to it before the store.
    pub compute_dtype: DType,
}

/// Result block of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileOutput {
    /// Destination pair rows, one per valid tile row.
    pub rows: Vec<usize>,
    pub col_start: usize,
    pub width: usize,
    /// `[rows.len(), width]`.
    pub values: Vec<f32>,
}

/// `(pid_m, pid_n)` of program `pid` in the grouped ordering: row tiles are
/// visited in bands of `group_m`, column-major inside a band.
pub fn tile_coords(pid: usize, num_pid_m: usize, num_pid_n: usize, group_m: usize) -> (usize, usize) {
    let num_pid_in_group = group_m * num_pid_n;
    let group_id = pid / num_pid_in_group;
    let first_pid_m = group_id * group_m;
    let group_size_m = (num_pid_m - first_pid_m).min(group_m);
    let pid_m = first_pid_m + (pid % num_pid_in_group) % group_size_m;
    let pid_n = (pid % num_pid_in_group) / group_size_m;
    (pid_m, pid_n)
}

/// Run the grouped GEMM, writing `[num_valid_tokens, N]` rows into `c`.
///
/// Rows of `c` that no tile covers keep their previous contents; with an
/// expert map, rows of experts on other shards are written as zeros.
pub fn invoke_fused_moe_kernel(args: &MoeGemmArgs<'_>, c: &mut [f32]) -> Result<()> {
    let MoeGemmArgs {
        a,
        b,
        topk_weights,
        permutation,
        mul_routed_weight,
        top_k,
        config,
        compute_dtype,
    } = *args;
    let (num_experts, n, k) = b.dims();
    let num_valid_tokens = permutation.num_valid_tokens;

    ensure!(top_k > 0, "top_k must be > 0");
    ensure!(
        a.cols() == k,
        "activation width {} does not match weight K {k}",
        a.cols()
    );
    ensure!(
        a.rows() * top_k == num_valid_tokens,
        "{} activation rows with top_k {top_k} do not cover {num_valid_tokens} pairs",
        a.rows()
    );
    ensure!(
        c.len() == num_valid_tokens * n,
        "output buffer holds {} values, expected {num_valid_tokens}x{n}",
        c.len()
    );
    if mul_routed_weight {
        ensure!(
            topk_weights.is_some_and(|w| w.len() == num_valid_tokens),
            "routing weights of length {num_valid_tokens} are required to apply router weights"
        );
    }
    if a.granularity().is_some() != b.mode().quantizes_activations() {
        return Err(MoeError::UnsupportedQuantization(format!(
            "activation quantization does not match {} weights",
            b.mode()
        )));
    }

    let tile = TileShape::resolve(
        config,
        &b.mode(),
        &GemmDims {
            num_valid_tokens,
            n,
            k,
            num_experts,
            top_k,
        },
    );
    ensure!(
        tile.block_m == permutation.block_size,
        "BLOCK_SIZE_M {} differs from the alignment block size {}",
        tile.block_m,
        permutation.block_size
    );

    let launch = Launch {
        a,
        b,
        topk_weights: if mul_routed_weight { topk_weights } else { None },
        permutation,
        top_k,
        tile,
        compute_dtype,
    };

    let outputs = match b.mode() {
        QuantMode::Full => launch.run(&PlainAccumulate),
        QuantMode::Fp8Tensor | QuantMode::Int8Tensor => {
            launch.run(&PostScaledAccumulate { per_channel: false })
        }
        QuantMode::Fp8Channel | QuantMode::Int8Channel => {
            launch.run(&PostScaledAccumulate { per_channel: true })
        }
        QuantMode::Fp8Block(shape) | QuantMode::Int8Block(shape) => {
            launch.run(&BlockScaledAccumulate { shape })
        }
        QuantMode::Int4WeightOnly { group_size } | QuantMode::Int8WeightOnly { group_size } => {
            launch.run(&WeightOnlyAccumulate { group_size })
        }
    };

    for out in outputs {
        for (r, &row) in out.rows.iter().enumerate() {
            let dst = &mut c[row * n + out.col_start..row * n + out.col_start + out.width];
            dst.copy_from_slice(&out.values[r * out.width..(r + 1) * out.width]);
        }
    }
    Ok(())
}

struct Launch<'a> {
    a: &'a QuantizedActivation,
    b: &'a ExpertWeights,
    topk_weights: Option<&'a [f32]>,
    permutation: &'a SortedTokenPermutation,
    top_k: usize,
    tile: TileShape,
    compute_dtype: DType,
}

impl Launch<'_> {
    fn run<D: DequantAccumulate>(&self, strategy: &D) -> Vec<TileOutput> {
        let TileShape {
            block_m, block_n, ..
        } = self.tile;
        let n = self.b.n();

        let mut em = self.permutation.sorted_token_ids.len();
        // Few tokens: at most one row block per pair can be in use.
        if self.a.rows() < block_m {
            em = em.min(self.a.rows() * self.top_k * block_m);
        }
        let num_pid_m = em.div_ceil(block_m);
        let num_pid_n = n.div_ceil(block_n);

        let masked = self.b.k() % self.tile.block_k != 0;
        (0..num_pid_m * num_pid_n)
            .into_par_iter()
            .filter_map(|pid| {
                let (pid_m, pid_n) = tile_coords(pid, num_pid_m, num_pid_n, self.tile.group_m);
                if masked {
                    self.tile_output::<D, true>(strategy, pid_m, pid_n)
                } else {
                    self.tile_output::<D, false>(strategy, pid_m, pid_n)
                }
            })
            .collect()
    }

    fn tile_output<D: DequantAccumulate, const MASKED: bool>(
        &self,
        strategy: &D,
        pid_m: usize,
        pid_n: usize,
    ) -> Option<TileOutput> {
        let TileShape {
            block_m,
            block_n,
            block_k,
            ..
        } = self.tile;
        let row_start = pid_m * block_m;
        let slot = self.permutation.block_expert(row_start)?;

        let num_valid = self.permutation.num_valid_tokens;
        let n = self.b.n();
        let col_start = pid_n * block_n;
        let width = block_n.min(n - col_start);

        let pairs: Vec<Option<usize>> = self.permutation.sorted_token_ids
            [row_start..(row_start + block_m).min(self.permutation.sorted_token_ids.len())]
            .iter()
            .map(|&p| (p < num_valid).then_some(p))
            .collect();
        let rows: Vec<usize> = pairs.iter().flatten().copied().collect();

        let expert = match slot {
            ExpertSlot::Local(e) => e,
            ExpertSlot::Absent => {
                return Some(TileOutput {
                    values: vec![0.0; rows.len() * width],
                    rows,
                    col_start,
                    width,
                });
            }
        };

        let a_rows: Vec<Option<usize>> = pairs.iter().map(|p| p.map(|p| p / self.top_k)).collect();
        let ctx = TileContext {
            a: self.a,
            b: self.b,
            expert,
            a_rows: &a_rows,
            cols: col_start..col_start + width,
            compute_dtype: self.compute_dtype,
        };

        let k = self.b.k();
        let mut acc = vec![0f32; a_rows.len() * width];
        let mut a_tile = vec![0f32; a_rows.len() * block_k];
        let mut b_tile = vec![0f32; width * block_k];
        for k_start in (0..k).step_by(block_k) {
            for (r, a_row) in a_rows.iter().enumerate() {
                let dst = &mut a_tile[r * block_k..(r + 1) * block_k];
                match a_row {
                    Some(row) => self.a.load_row_segment::<MASKED>(*row, k_start, dst),
                    None => dst.fill(0.0),
                }
            }
            self.b
                .load_raw_tile::<MASKED>(expert, ctx.cols.clone(), k_start, block_k, &mut b_tile);
            let step = KStep {
                k_start,
                k_valid: block_k.min(k - k_start),
                block_k,
                a_tile: &a_tile,
                b_tile: &b_tile,
            };
            strategy.step(&ctx, &step, &mut acc);
        }
        strategy.finish(&ctx, &mut acc);

        let mut values = Vec::with_capacity(rows.len() * width);
        for (r, pair) in pairs.iter().enumerate() {
            let Some(pair) = *pair else { continue };
            let weight = self.topk_weights.map_or(1.0, |w| w[pair]);
            values.extend(
                acc[r * width..(r + 1) * width]
                    .iter()
                    .map(|&v| round_to(self.compute_dtype, v * weight)),
            );
        }
        Some(TileOutput {
            rows,
            col_start,
            width,
            values,
        })
    }
}
