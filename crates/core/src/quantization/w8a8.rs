//! FP8 weight helpers used when loading fused checkpoints.

use candle_core::{DType, Tensor};

use super::fp8::{fp8_e4m3_decode, fp8_e4m3_encode, FP8_E4M3_MAX};
use crate::error::{ensure, Result};

/// Dequantize a tensor with a single scale. FP8 (`U8`) inputs are decoded,
/// float inputs are scaled directly. Output is `F32`.
pub fn per_tensor_dequantize(tensor: &Tensor, inv_scale: f32) -> Result<Tensor> {
    let decoded = if tensor.dtype() == DType::U8 {
        let bytes: Vec<u8> = tensor.flatten_all()?.to_vec1()?;
        let values: Vec<f32> = bytes.into_iter().map(fp8_e4m3_decode).collect();
        Tensor::from_vec(values, tensor.dims(), tensor.device())?
    } else {
        tensor.to_dtype(DType::F32)?
    };
    Ok((decoded * inv_scale as f64)?)
}

/// True when every element of a 1-D tensor is close to the first one
/// (`|a - b| <= 1e-8 + 1e-5 * |b|`).
pub fn all_close_1d(x: &Tensor) -> Result<bool> {
    ensure!(x.rank() == 1, "all_close_1d expects a 1-D tensor, got {:?}", x.dims());
    let v: Vec<f32> = x.to_dtype(DType::F32)?.to_vec1()?;
    let Some(&first) = v.first() else {
        return Ok(true);
    };
    Ok(v.iter().all(|&b| (first - b).abs() <= 1e-8 + 1e-5 * b.abs()))
}

/// Re-encode the logical shards of a fused FP8 weight `[sum(widths), K]`
/// with the largest shard scale.
///
/// A last scale at or below `-FP8_E4M3_MAX` marks a checkpoint that was
/// already fused on disk with a single scale; the weight is left unchanged.
pub fn requantize_with_max_scale(
    weight: &Tensor,
    weight_scale: &[f32],
    logical_widths: &[usize],
) -> Result<(f32, Tensor)> {
    let (rows, cols) = weight.dims2()?;
    ensure!(weight.dtype() == DType::U8, "fused FP8 weight must be U8");
    ensure!(
        weight_scale.len() == logical_widths.len(),
        "{} scales for {} logical shards",
        weight_scale.len(),
        logical_widths.len()
    );
    ensure!(
        logical_widths.iter().sum::<usize>() == rows,
        "logical widths {logical_widths:?} do not cover {rows} rows"
    );
    let max_scale = weight_scale.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    let unfused_on_disk = weight_scale.last().is_some_and(|&s| s > -FP8_E4M3_MAX);
    if !unfused_on_disk {
        return Ok((max_scale, weight.clone()));
    }

    let mut bytes: Vec<u8> = weight.flatten_all()?.to_vec1()?;
    let mut start = 0;
    for (&width, &scale) in logical_widths.iter().zip(weight_scale) {
        for b in &mut bytes[start * cols..(start + width) * cols] {
            *b = fp8_e4m3_encode(fp8_e4m3_decode(*b) * scale / max_scale);
        }
        start += width;
    }
    Ok((
        max_scale,
        Tensor::from_vec(bytes, (rows, cols), weight.device())?,
    ))
}
