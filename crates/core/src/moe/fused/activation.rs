//! Gated activations between the two expert GEMMs.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, D};

use crate::error::{ensure, MoeError, Result};

/// Gate nonlinearity. The GEMM1 output `[rows, 2 * d]` is split into a gate
/// half and a value half; the result is `act(gate) * value`, `[rows, d]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Silu,
    /// Exact (erf) GELU.
    Gelu,
}

impl FromStr for Activation {
    type Err = MoeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "silu" | "swiglu" => Ok(Self::Silu),
            "gelu" => Ok(Self::Gelu),
            other => Err(MoeError::PreconditionViolation(format!(
                "unsupported fused MoE activation: {other}"
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silu => write!(f, "silu"),
            Self::Gelu => write!(f, "gelu"),
        }
    }
}

impl Activation {
    /// `act(x[.., :d]) * x[.., d:]` over the last dimension.
    pub fn apply_and_mul(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.dim(D::Minus1)?;
        ensure!(
            width % 2 == 0,
            "gated activation needs an even last dimension, got {width}"
        );
        let d = width / 2;
        let gate = x.narrow(D::Minus1, 0, d)?;
        let value = x.narrow(D::Minus1, d, d)?;
        let gate = match self {
            Self::Silu => candle_nn::ops::silu(&gate)?,
            Self::Gelu => gate.gelu_erf()?,
        };
        Ok((gate * value)?)
    }

    /// Host variant over a row-major `[rows, 2 * d]` buffer. Computed in
    /// `f32`, rounded to `compute_dtype` on the way out.
    pub fn apply_and_mul_into(
        &self,
        input: &[f32],
        width: usize,
        compute_dtype: DType,
        out: &mut [f32],
    ) -> Result<()> {
        ensure!(
            width > 0 && input.len() % width == 0,
            "activation input of {} values is not a multiple of width {width}",
            input.len()
        );
        let rows = input.len() / width;
        ensure!(
            out.len() == rows * (width / 2),
            "activation output holds {} values, expected {rows}x{}",
            out.len(),
            width / 2
        );
        if rows == 0 {
            return Ok(());
        }
        let x = Tensor::from_slice(input, (rows, width), &Device::Cpu)?;
        let y = self
            .apply_and_mul(&x)?
            .to_dtype(compute_dtype)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        out.copy_from_slice(&y);
        Ok(())
    }
}
