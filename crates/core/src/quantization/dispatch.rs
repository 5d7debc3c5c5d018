//! Activation-side quantization dispatch.
//!
//! Maps a [`QuantMode`] onto the activation quantizer it needs and packages
//! the result in the host layout the grouped GEMM tiles read from.

use super::fp8::fp8_e4m3_decode;
use super::mode::QuantMode;
use super::primitives::{
    fp8_dynamic_scales, int8_dynamic_scales, quantize_fp8_host, quantize_int8_host,
    ActScaleGranularity,
};
use super::weights::ScaleTensor;
use crate::error::{ensure, MoeError, Result};

/// Host storage of (possibly quantized) activation values.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationValues {
    F32(Vec<f32>),
    Fp8(Vec<u8>),
    Int8(Vec<i8>),
}

/// Activation matrix `[rows, cols]` ready for the grouped GEMM.
#[derive(Debug, Clone)]
pub struct QuantizedActivation {
    values: ActivationValues,
    rows: usize,
    cols: usize,
    scales: Vec<f32>,
    granularity: Option<ActScaleGranularity>,
}

impl QuantizedActivation {
    /// Unquantized activations.
    pub fn full(values: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        ensure!(
            values.len() == rows * cols,
            "activation buffer holds {} values, expected {rows}x{cols}",
            values.len()
        );
        Ok(Self {
            values: ActivationValues::F32(values),
            rows,
            cols,
            scales: Vec::new(),
            granularity: None,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn values(&self) -> &ActivationValues {
        &self.values
    }

    /// Granularity of the activation scale, `None` when unquantized.
    pub fn granularity(&self) -> Option<ActScaleGranularity> {
        self.granularity
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Scale of element `(row, col)`; 1.0 when unquantized.
    #[inline]
    pub(crate) fn scale_at(&self, row: usize, col: usize) -> f32 {
        match self.granularity {
            Some(g) => self.scales[g.index(row, col, self.cols)],
            None => 1.0,
        }
    }

    /// Copy the raw values of `row[k_start .. k_start + out.len()]` into
    /// `out`, zero-filling past the last column when `MASKED`.
    #[inline]
    pub(crate) fn load_row_segment<const MASKED: bool>(
        &self,
        row: usize,
        k_start: usize,
        out: &mut [f32],
    ) {
        let valid = if MASKED {
            self.cols.saturating_sub(k_start).min(out.len())
        } else {
            out.len()
        };
        let base = row * self.cols + k_start;
        match &self.values {
            ActivationValues::F32(v) => out[..valid].copy_from_slice(&v[base..base + valid]),
            ActivationValues::Fp8(v) => {
                for (d, &b) in out[..valid].iter_mut().zip(&v[base..base + valid]) {
                    *d = fp8_e4m3_decode(b);
                }
            }
            ActivationValues::Int8(v) => {
                for (d, &q) in out[..valid].iter_mut().zip(&v[base..base + valid]) {
                    *d = q as f32;
                }
            }
        }
        if MASKED {
            out[valid..].fill(0.0);
        }
    }

    /// Dequantized copy, mainly for reference computations.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0f32; self.rows * self.cols];
        for row in 0..self.rows {
            let dst = &mut out[row * self.cols..(row + 1) * self.cols];
            self.load_row_segment::<false>(row, 0, dst);
            for (col, d) in dst.iter_mut().enumerate() {
                *d *= self.scale_at(row, col);
            }
        }
        out
    }
}

/// Quantize a row-major `[rows, cols]` activation matrix the way `mode`
/// requires.
///
/// * full precision and weight-only modes pass through unchanged
/// * FP8 tensor/channel use the static `a_scale` when given, otherwise a
///   dynamic per-tensor (tensor) or per-token (channel) scale
/// * block-wise modes use dynamic per-token-group scales with group size
///   `block_k` and reject a static scale
/// * INT8 channel uses a dynamic per-token scale
pub fn prepare_activation(
    values: Vec<f32>,
    rows: usize,
    cols: usize,
    a_scale: Option<&ScaleTensor>,
    mode: &QuantMode,
) -> Result<QuantizedActivation> {
    ensure!(
        values.len() == rows * cols,
        "activation buffer holds {} values, expected {rows}x{cols}",
        values.len()
    );
    if !mode.quantizes_activations() && a_scale.is_some() {
        return Err(MoeError::UnsupportedQuantization(format!(
            "an activation scale was given but {mode} does not quantize activations"
        )));
    }

    let (granularity, scales) = match *mode {
        QuantMode::Full | QuantMode::Int4WeightOnly { .. } | QuantMode::Int8WeightOnly { .. } => {
            return QuantizedActivation::full(values, rows, cols)
        }
        QuantMode::Fp8Tensor | QuantMode::Fp8Channel => match a_scale {
            Some(scale) => {
                let granularity = ActScaleGranularity::infer(scale.dims(), rows, cols)?;
                if matches!(granularity, ActScaleGranularity::Group(_)) {
                    return Err(MoeError::UnsupportedQuantization(
                        "a static FP8 activation scale must be per-tensor or per-token"
                            .to_string(),
                    ));
                }
                (granularity, scale.values().to_vec())
            }
            None => {
                let granularity = if *mode == QuantMode::Fp8Channel {
                    ActScaleGranularity::Token
                } else {
                    ActScaleGranularity::Tensor
                };
                (granularity, fp8_dynamic_scales(&values, rows, cols, granularity))
            }
        },
        QuantMode::Fp8Block(shape) => {
            reject_static(a_scale, mode)?;
            let granularity = group_granularity(cols, shape.block_k)?;
            (granularity, fp8_dynamic_scales(&values, rows, cols, granularity))
        }
        QuantMode::Int8Channel => {
            reject_static(a_scale, mode)?;
            let granularity = ActScaleGranularity::Token;
            (granularity, int8_dynamic_scales(&values, rows, cols, granularity))
        }
        QuantMode::Int8Block(shape) => {
            reject_static(a_scale, mode)?;
            let granularity = group_granularity(cols, shape.block_k)?;
            (granularity, int8_dynamic_scales(&values, rows, cols, granularity))
        }
        QuantMode::Int8Tensor => {
            return Err(MoeError::UnsupportedQuantization(
                "int8 w8a8 activations only support channel-wise or block-wise scaling"
                    .to_string(),
            ))
        }
    };

    let quantized = match mode {
        QuantMode::Fp8Tensor | QuantMode::Fp8Channel | QuantMode::Fp8Block(_) => {
            ActivationValues::Fp8(quantize_fp8_host(&values, cols, &scales, granularity))
        }
        _ => ActivationValues::Int8(quantize_int8_host(&values, cols, &scales, granularity)),
    };
    Ok(QuantizedActivation {
        values: quantized,
        rows,
        cols,
        scales,
        granularity: Some(granularity),
    })
}

fn reject_static(a_scale: Option<&ScaleTensor>, mode: &QuantMode) -> Result<()> {
    if a_scale.is_some() {
        return Err(MoeError::UnsupportedQuantization(format!(
            "{mode} computes activation scales dynamically; a static scale is not supported"
        )));
    }
    Ok(())
}

fn group_granularity(cols: usize, group: usize) -> Result<ActScaleGranularity> {
    ensure!(
        group > 0 && cols % group == 0,
        "activation width {cols} must be divisible by block_k {group}"
    );
    Ok(ActScaleGranularity::Group(group))
}
