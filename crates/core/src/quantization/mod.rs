//! Quantization support for the fused MoE path.
//!
//! - `mode`: the quantization modes the grouped GEMM dispatches on
//! - `fp8`: FP8 E4M3 encoding
//! - `primitives`: activation quantizers (per-tensor, per-token, per-token-group)
//! - `dispatch`: mode-driven activation preparation
//! - `weights`: stacked expert weights and weight quantizers
//! - `w8a8`: FP8 checkpoint helpers
//! - `awq`: AWQ 4-bit linear layer

pub mod awq;
pub mod dispatch;
pub mod fp8;
pub mod mode;
pub mod primitives;
pub mod w8a8;
pub mod weights;

pub use awq::{AwqConfig, AwqLinear};
pub use dispatch::{prepare_activation, ActivationValues, QuantizedActivation};
pub use fp8::{fp8_e4m3_decode, fp8_e4m3_encode, FP8_E4M3_MAX};
pub use mode::{BlockShape, QuantFlags, QuantMode};
pub use primitives::{
    dequantize_activation, per_token_group_quant_fp8, per_token_group_quant_int8,
    per_token_quant_int8, scaled_fp8_quant, ActScaleGranularity,
};
pub use w8a8::{all_close_1d, per_tensor_dequantize, requantize_with_max_scale};
pub use weights::{quantize_expert_weights, ExpertWeights, ScaleTensor, WeightData, ZeroPoint};
