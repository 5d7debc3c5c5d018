//! Activation quantization primitives (FP8 E4M3 and INT8).
//!
//! The host-slice functions do the work; the tensor functions wrap them with
//! the candle storage conventions used across the crate: FP8 values as `U8`
//! bytes, INT8 values as `I64`, scales as `F32`.

use candle_core::{DType, Device, Tensor};

use super::fp8::{fp8_e4m3_decode, fp8_e4m3_encode, FP8_E4M3_MAX};
use crate::error::{ensure, MoeError, Result};

const INT8_MAX: f32 = 127.0;
/// Smallest dynamic FP8 scale; keeps all-zero rows finite.
const FP8_MIN_SCALE: f32 = 1.0 / (FP8_E4M3_MAX * 512.0);
const GROUP_EPS: f32 = 1e-10;

/// How many activation elements share one scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActScaleGranularity {
    /// One scale for the whole matrix.
    Tensor,
    /// One scale per row (token).
    Token,
    /// One scale per `(row, column group)`.
    Group(usize),
}

impl ActScaleGranularity {
    /// Number of scales for a `rows x cols` matrix.
    pub fn num_scales(&self, rows: usize, cols: usize) -> usize {
        match self {
            Self::Tensor => 1,
            Self::Token => rows,
            Self::Group(g) => rows * cols.div_ceil(*g),
        }
    }

    /// Scale tensor shape for a `rows x cols` matrix.
    pub fn scale_dims(&self, rows: usize, cols: usize) -> Vec<usize> {
        match self {
            Self::Tensor => vec![1],
            Self::Token => vec![rows, 1],
            Self::Group(g) => vec![rows, cols.div_ceil(*g)],
        }
    }

    #[inline]
    pub(crate) fn index(&self, row: usize, col: usize, cols: usize) -> usize {
        match self {
            Self::Tensor => 0,
            Self::Token => row,
            Self::Group(g) => row * cols.div_ceil(*g) + col / g,
        }
    }

    /// Infer the granularity from a scale tensor's element count and shape.
    pub fn infer(scale_dims: &[usize], rows: usize, cols: usize) -> Result<Self> {
        let numel: usize = scale_dims.iter().product();
        if numel == 1 {
            return Ok(Self::Tensor);
        }
        match scale_dims {
            [r] | [r, 1] if *r == rows => Ok(Self::Token),
            [r, groups] if *r == rows && *groups > 0 && cols % groups == 0 => {
                Ok(Self::Group(cols / groups))
            }
            _ => Err(MoeError::PreconditionViolation(format!(
                "activation scale shape {scale_dims:?} does not fit a {rows}x{cols} input"
            ))),
        }
    }
}

/// Dynamic scales for `x` (row-major `rows x cols`) at the given granularity.
pub(crate) fn dynamic_scales(
    x: &[f32],
    rows: usize,
    cols: usize,
    granularity: ActScaleGranularity,
    qmax: f32,
    min_scale: f32,
) -> Vec<f32> {
    let mut absmax = vec![0f32; granularity.num_scales(rows, cols)];
    for row in 0..rows {
        for col in 0..cols {
            let idx = granularity.index(row, col, cols);
            absmax[idx] = absmax[idx].max(x[row * cols + col].abs());
        }
    }
    absmax.into_iter().map(|m| (m / qmax).max(min_scale)).collect()
}

/// Encode `x` to FP8 with the given scales.
pub(crate) fn quantize_fp8_host(
    x: &[f32],
    cols: usize,
    scales: &[f32],
    granularity: ActScaleGranularity,
) -> Vec<u8> {
    x.iter()
        .enumerate()
        .map(|(i, &v)| fp8_e4m3_encode(v / scales[granularity.index(i / cols, i % cols, cols)]))
        .collect()
}

/// Round `x` to symmetric INT8 with the given scales.
pub(crate) fn quantize_int8_host(
    x: &[f32],
    cols: usize,
    scales: &[f32],
    granularity: ActScaleGranularity,
) -> Vec<i8> {
    x.iter()
        .enumerate()
        .map(|(i, &v)| {
            let s = scales[granularity.index(i / cols, i % cols, cols)];
            (v / s).round().clamp(-INT8_MAX, INT8_MAX) as i8
        })
        .collect()
}

pub(crate) fn fp8_dynamic_scales(
    x: &[f32],
    rows: usize,
    cols: usize,
    granularity: ActScaleGranularity,
) -> Vec<f32> {
    let min_scale = match granularity {
        ActScaleGranularity::Group(_) => GROUP_EPS / FP8_E4M3_MAX,
        _ => FP8_MIN_SCALE,
    };
    dynamic_scales(x, rows, cols, granularity, FP8_E4M3_MAX, min_scale)
}

pub(crate) fn int8_dynamic_scales(
    x: &[f32],
    rows: usize,
    cols: usize,
    granularity: ActScaleGranularity,
) -> Vec<f32> {
    dynamic_scales(x, rows, cols, granularity, INT8_MAX, GROUP_EPS / INT8_MAX)
}

fn host_matrix(input: &Tensor) -> Result<(Vec<f32>, usize, usize)> {
    let (rows, cols) = input.dims2()?;
    let values = input.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok((values, rows, cols))
}

fn scale_tensor(scales: Vec<f32>, dims: Vec<usize>, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(scales, dims, device)?)
}

/// Quantize a 2-D tensor to FP8.
///
/// # Arguments
/// * `input` - `[num_tokens, hidden_size]` in any float dtype
/// * `scale` - static scale, `[1]` or `[num_tokens]`/`[num_tokens, 1]`; `None` for dynamic
/// * `per_token` - dynamic scaling per token instead of per tensor
///
/// # Returns
/// `(values U8, scale F32)`
pub fn scaled_fp8_quant(
    input: &Tensor,
    scale: Option<&Tensor>,
    per_token: bool,
) -> Result<(Tensor, Tensor)> {
    let (x, rows, cols) = host_matrix(input)?;
    let (scales, granularity) = match scale {
        Some(s) => {
            let granularity = ActScaleGranularity::infer(s.dims(), rows, cols)?;
            ensure!(
                !matches!(granularity, ActScaleGranularity::Group(_)),
                "static FP8 scale must be per-tensor or per-token"
            );
            let values = s.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            (values, granularity)
        }
        None => {
            let granularity = if per_token {
                ActScaleGranularity::Token
            } else {
                ActScaleGranularity::Tensor
            };
            (fp8_dynamic_scales(&x, rows, cols, granularity), granularity)
        }
    };
    let q = quantize_fp8_host(&x, cols, &scales, granularity);
    let device = input.device();
    Ok((
        Tensor::from_vec(q, (rows, cols), device)?,
        scale_tensor(scales, granularity.scale_dims(rows, cols), device)?,
    ))
}

/// Dynamic FP8 quantization with one scale per token and `group_size`
/// columns. Returns `(values U8 [M, K], scale F32 [M, K / group_size])`.
pub fn per_token_group_quant_fp8(input: &Tensor, group_size: usize) -> Result<(Tensor, Tensor)> {
    let (x, rows, cols) = host_matrix(input)?;
    ensure!(
        group_size > 0 && cols % group_size == 0,
        "hidden size {cols} must be divisible by group size {group_size}"
    );
    let granularity = ActScaleGranularity::Group(group_size);
    let scales = fp8_dynamic_scales(&x, rows, cols, granularity);
    let q = quantize_fp8_host(&x, cols, &scales, granularity);
    let device = input.device();
    Ok((
        Tensor::from_vec(q, (rows, cols), device)?,
        scale_tensor(scales, granularity.scale_dims(rows, cols), device)?,
    ))
}

/// Dynamic symmetric INT8 quantization per token.
/// Returns `(values I64 [M, K], scale F32 [M, 1])`.
pub fn per_token_quant_int8(input: &Tensor) -> Result<(Tensor, Tensor)> {
    int8_quant(input, ActScaleGranularity::Token)
}

/// Dynamic symmetric INT8 quantization per token and column group.
/// Returns `(values I64 [M, K], scale F32 [M, K / group_size])`.
pub fn per_token_group_quant_int8(input: &Tensor, group_size: usize) -> Result<(Tensor, Tensor)> {
    let (_, cols) = input.dims2()?;
    ensure!(
        group_size > 0 && cols % group_size == 0,
        "hidden size {cols} must be divisible by group size {group_size}"
    );
    int8_quant(input, ActScaleGranularity::Group(group_size))
}

fn int8_quant(input: &Tensor, granularity: ActScaleGranularity) -> Result<(Tensor, Tensor)> {
    let (x, rows, cols) = host_matrix(input)?;
    let scales = int8_dynamic_scales(&x, rows, cols, granularity);
    let q: Vec<i64> = quantize_int8_host(&x, cols, &scales, granularity)
        .into_iter()
        .map(i64::from)
        .collect();
    let device = input.device();
    Ok((
        Tensor::from_vec(q, (rows, cols), device)?,
        scale_tensor(scales, granularity.scale_dims(rows, cols), device)?,
    ))
}

/// Dequantize FP8 (`U8`) or INT8 (`I64`) activations back to `F32`. The
/// granularity is inferred from the scale shape.
pub fn dequantize_activation(values: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let (rows, cols) = values.dims2()?;
    let granularity = ActScaleGranularity::infer(scale.dims(), rows, cols)?;
    let scales = scale.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let flat = values.flatten_all()?;
    let raw: Vec<f32> = match flat.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?.into_iter().map(fp8_e4m3_decode).collect(),
        DType::I64 => flat.to_vec1::<i64>()?.into_iter().map(|v| v as f32).collect(),
        other => {
            return Err(MoeError::UnsupportedQuantization(format!(
                "cannot dequantize activations stored as {other:?}"
            )))
        }
    };
    let out: Vec<f32> = raw
        .into_iter()
        .enumerate()
        .map(|(i, q)| q * scales[granularity.index(i / cols, i % cols, cols)])
        .collect();
    Ok(Tensor::from_vec(out, (rows, cols), values.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> Tensor {
        Tensor::new(
            &[[0.5f32, -1.0, 2.0, 0.25], [0.0, 0.0, 0.0, 0.0], [3.0, -6.0, 0.1, 0.2]],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn max_err(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_dynamic_per_tensor_fp8_scale() {
        let (q, s) = scaled_fp8_quant(&input(), None, false).unwrap();
        assert_eq!(q.dtype(), DType::U8);
        assert_eq!(s.dims(), &[1]);
        let scale = s.to_vec1::<f32>().unwrap()[0];
        assert!((scale - 6.0 / FP8_E4M3_MAX).abs() < 1e-9);
        let deq = dequantize_activation(&q, &s).unwrap();
        assert!(max_err(&deq, &input()) <= 6.0 / 16.0);
    }

    #[test]
    fn test_dynamic_per_token_fp8_zero_row_finite() {
        let (q, s) = scaled_fp8_quant(&input(), None, true).unwrap();
        assert_eq!(s.dims(), &[3, 1]);
        let scales: Vec<f32> = s.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(scales[1], FP8_MIN_SCALE);
        let row: Vec<u8> = q.get(1).unwrap().to_vec1().unwrap();
        assert!(row.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_static_fp8_scale_is_used() {
        let scale = Tensor::new(&[0.5f32], &Device::Cpu).unwrap();
        let (q, s) = scaled_fp8_quant(&input(), Some(&scale), false).unwrap();
        assert_eq!(s.to_vec1::<f32>().unwrap(), vec![0.5]);
        // 2.0 / 0.5 = 4.0 encodes exactly
        let first: Vec<u8> = q.get(0).unwrap().to_vec1().unwrap();
        assert_eq!(fp8_e4m3_decode(first[2]), 4.0);
    }

    #[test]
    fn test_group_fp8_shapes_and_error() {
        let (q, s) = per_token_group_quant_fp8(&input(), 2).unwrap();
        assert_eq!(s.dims(), &[3, 2]);
        let deq = dequantize_activation(&q, &s).unwrap();
        assert!(max_err(&deq, &input()) <= 6.0 / 16.0);
    }

    #[test]
    fn test_group_size_must_divide() {
        assert!(per_token_group_quant_fp8(&input(), 3).is_err());
        assert!(per_token_group_quant_int8(&input(), 3).is_err());
    }

    #[test]
    fn test_int8_per_token() {
        let (q, s) = per_token_quant_int8(&input()).unwrap();
        assert_eq!(q.dtype(), DType::I64);
        let row: Vec<i64> = q.get(2).unwrap().to_vec1().unwrap();
        assert_eq!(row[1], -127);
        let scales: Vec<f32> = s.flatten_all().unwrap().to_vec1().unwrap();
        let deq = dequantize_activation(&q, &s).unwrap();
        assert!(max_err(&deq, &input()) <= scales[2] / 2.0 + 1e-6);
    }

    #[test]
    fn test_granularity_inference() {
        assert_eq!(
            ActScaleGranularity::infer(&[1], 4, 8).unwrap(),
            ActScaleGranularity::Tensor
        );
        assert_eq!(
            ActScaleGranularity::infer(&[4, 1], 4, 8).unwrap(),
            ActScaleGranularity::Token
        );
        assert_eq!(
            ActScaleGranularity::infer(&[4, 2], 4, 8).unwrap(),
            ActScaleGranularity::Group(4)
        );
        assert!(ActScaleGranularity::infer(&[3, 2], 4, 8).is_err());
    }
}
