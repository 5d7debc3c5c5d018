//! Top-k slot reduction: `out[t, :] = sum_s input[t, s, :]`.

use candle_core::{DType, Tensor};

use crate::error::{ensure, Result};

/// Sum a `[M, top_k, K]` tensor over the slot dimension, keeping its dtype.
pub fn moe_sum(input: &Tensor) -> Result<Tensor> {
    let (_m, _top_k, _k) = input.dims3()?;
    let dtype = input.dtype();
    Ok(input.to_dtype(DType::F32)?.sum(1)?.to_dtype(dtype)?)
}

/// Host variant over row-major buffers. Accumulates in `f32` and rounds the
/// result to `compute_dtype`.
pub fn moe_sum_into(
    input: &[f32],
    top_k: usize,
    k: usize,
    compute_dtype: DType,
    out: &mut [f32],
) -> Result<()> {
    ensure!(top_k > 0 && k > 0, "top_k and K must be > 0");
    ensure!(
        input.len() == out.len() * top_k,
        "reduction input holds {} values, expected {} x top_k {top_k}",
        input.len(),
        out.len()
    );
    ensure!(out.len() % k == 0, "output length {} is not a multiple of K {k}", out.len());

    for (token, dst) in out.chunks_exact_mut(k).enumerate() {
        let base = token * top_k * k;
        for (col, d) in dst.iter_mut().enumerate() {
            let sum: f32 = (0..top_k).map(|s| input[base + s * k + col]).sum();
            *d = super::kernel::round_to(compute_dtype, sum);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_moe_sum_tensor() {
        let x = Tensor::new(
            &[[[1.0f32, 2.0], [3.0, 4.0]], [[0.5, 0.5], [-1.0, 1.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let y: Vec<Vec<f32>> = moe_sum(&x).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![4.0, 6.0], vec![-0.5, 1.5]]);
    }

    #[test]
    fn test_moe_sum_into() {
        let input = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 0.5, 0.5, -1.0, 1.0, 0.0, 0.0];
        let mut out = [0f32; 4];
        moe_sum_into(&input, 3, 2, DType::F32, &mut out).unwrap();
        assert_eq!(out, [9.0, 12.0, -0.5, 1.5]);
    }

    #[test]
    fn test_moe_sum_into_shape_mismatch() {
        let mut out = [0f32; 2];
        assert!(moe_sum_into(&[1.0; 5], 2, 2, DType::F32, &mut out).is_err());
    }
}
