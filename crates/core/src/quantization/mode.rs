//! Quantization modes understood by the grouped GEMM kernel.
//!
//! `QuantMode` is the tagged variant the kernel dispatches on. `QuantFlags`
//! is the flat flag set used by model configs (`use_fp8_w8a8`,
//! `per_channel_quant`, `block_shape`, ...) and resolves to a `QuantMode`.

use std::fmt;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};

/// Block shape `[block_n, block_k]` for block-wise quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockShape {
    /// Output-channel block size.
    pub block_n: usize,
    /// Reduction-dimension block size.
    pub block_k: usize,
}

impl BlockShape {
    pub fn new(block_n: usize, block_k: usize) -> Self {
        Self { block_n, block_k }
    }

    /// Number of scale blocks covering `n` output channels and `k` inputs.
    pub fn grid(&self, n: usize, k: usize) -> (usize, usize) {
        (n.div_ceil(self.block_n), k.div_ceil(self.block_k))
    }
}

impl fmt::Display for BlockShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.block_n, self.block_k)
    }
}

/// Weight/activation precision of one grouped GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QuantMode {
    /// Full precision weights and activations.
    #[default]
    Full,
    /// FP8 weights and activations, one scale per expert / per tensor.
    Fp8Tensor,
    /// FP8 weights with per-output-channel scale, per-token activation scale.
    Fp8Channel,
    /// FP8 weights and activations with block-wise scales.
    Fp8Block(BlockShape),
    /// INT8 weights and activations, one scale per expert / per tensor.
    Int8Tensor,
    /// INT8 weights with per-output-channel scale, per-token activation scale.
    Int8Channel,
    /// INT8 weights and activations with block-wise scales.
    Int8Block(BlockShape),
    /// Packed 4-bit weights with group-wise scale; activations unquantized.
    Int4WeightOnly { group_size: usize },
    /// 8-bit weights with group-wise scale; activations unquantized.
    Int8WeightOnly { group_size: usize },
}

impl QuantMode {
    /// Whether activations are quantized alongside the weights.
    pub fn quantizes_activations(&self) -> bool {
        matches!(
            self,
            Self::Fp8Tensor
                | Self::Fp8Channel
                | Self::Fp8Block(_)
                | Self::Int8Tensor
                | Self::Int8Channel
                | Self::Int8Block(_)
        )
    }

    pub fn is_weight_only(&self) -> bool {
        matches!(
            self,
            Self::Int4WeightOnly { .. } | Self::Int8WeightOnly { .. }
        )
    }

    /// Block shape in the `[block_n, block_k]` convention. Weight-only modes
    /// report `[0, group_size]`.
    pub fn block_shape(&self) -> Option<BlockShape> {
        match *self {
            Self::Fp8Block(shape) | Self::Int8Block(shape) => Some(shape),
            Self::Int4WeightOnly { group_size } | Self::Int8WeightOnly { group_size } => {
                Some(BlockShape::new(0, group_size))
            }
            _ => None,
        }
    }

    /// Group size of weight-only modes.
    pub fn group_size(&self) -> Option<usize> {
        match *self {
            Self::Int4WeightOnly { group_size } | Self::Int8WeightOnly { group_size } => {
                Some(group_size)
            }
            _ => None,
        }
    }

    /// Stored bits per weight element.
    pub fn weight_bits(&self) -> u32 {
        match self {
            Self::Full => 32,
            Self::Int4WeightOnly { .. } => 4,
            _ => 8,
        }
    }

    /// Tag used in tuned config file names, `None` when no tag applies.
    pub fn config_dtype_str(&self, compute_dtype: DType) -> Option<&'static str> {
        match self {
            Self::Fp8Tensor | Self::Fp8Channel | Self::Fp8Block(_) => Some("fp8_w8a8"),
            Self::Int8WeightOnly { .. } => Some("int8_w8a16"),
            Self::Int4WeightOnly { .. } => Some("int4_w4a16"),
            // float32 MoE reuses the fp16/bf16 tables otherwise
            _ if compute_dtype == DType::F32 => Some("float32"),
            _ => None,
        }
    }

    /// True when `other` belongs to the same precision family, which both
    /// expert weight stacks of one layer must share.
    pub fn same_family(&self, other: &QuantMode) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for QuantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Fp8Tensor => write!(f, "fp8_tensor"),
            Self::Fp8Channel => write!(f, "fp8_channel"),
            Self::Fp8Block(s) => write!(f, "fp8_block{s}"),
            Self::Int8Tensor => write!(f, "int8_tensor"),
            Self::Int8Channel => write!(f, "int8_channel"),
            Self::Int8Block(s) => write!(f, "int8_block{s}"),
            Self::Int4WeightOnly { group_size } => write!(f, "int4_w4a16(g={group_size})"),
            Self::Int8WeightOnly { group_size } => write!(f, "int8_w8a16(g={group_size})"),
        }
    }
}

/// Flat quantization flags as carried by layer configs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantFlags {
    pub use_fp8_w8a8: bool,
    pub use_int8_w8a8: bool,
    pub use_int8_w8a16: bool,
    pub use_int4_w4a16: bool,
    pub per_channel_quant: bool,
    /// `[block_n, block_k]`; weight-only modes use `[0, group_size]`.
    pub block_shape: Option<[usize; 2]>,
}

impl QuantFlags {
    /// Resolve the flag set into a single [`QuantMode`].
    pub fn resolve(&self) -> Result<QuantMode> {
        let enabled = [
            self.use_fp8_w8a8,
            self.use_int8_w8a8,
            self.use_int8_w8a16,
            self.use_int4_w4a16,
        ]
        .iter()
        .filter(|&&f| f)
        .count();
        if enabled > 1 {
            return Err(MoeError::Configuration(
                "at most one of use_fp8_w8a8, use_int8_w8a8, use_int8_w8a16, use_int4_w4a16 may be set"
                    .to_string(),
            ));
        }

        let block = match self.block_shape {
            Some([n, k]) if n > 0 && k > 0 => Some(BlockShape::new(n, k)),
            _ => None,
        };

        if self.use_fp8_w8a8 {
            return Ok(match (block, self.per_channel_quant) {
                (Some(shape), _) => QuantMode::Fp8Block(shape),
                (None, true) => QuantMode::Fp8Channel,
                (None, false) => QuantMode::Fp8Tensor,
            });
        }

        if self.use_int8_w8a8 {
            return match (block, self.per_channel_quant) {
                (Some(shape), _) => Ok(QuantMode::Int8Block(shape)),
                (None, true) => Ok(QuantMode::Int8Channel),
                (None, false) => Err(MoeError::UnsupportedQuantization(
                    "int8 w8a8 only supports block-wise or channel-wise quantization; \
                     set per_channel_quant or block_shape"
                        .to_string(),
                )),
            };
        }

        if self.use_int8_w8a16 || self.use_int4_w4a16 {
            let group_size = match self.block_shape {
                Some([0, g]) if g > 0 => g,
                Some([n, _]) if n != 0 => {
                    return Err(MoeError::UnsupportedQuantization(format!(
                        "weight-only quantization is group-wise along K; block_shape[0] must be 0, got {n}"
                    )))
                }
                _ => {
                    return Err(MoeError::Configuration(
                        "weight-only quantization requires block_shape = [0, group_size]"
                            .to_string(),
                    ))
                }
            };
            return Ok(if self.use_int4_w4a16 {
                QuantMode::Int4WeightOnly { group_size }
            } else {
                QuantMode::Int8WeightOnly { group_size }
            });
        }

        if self.per_channel_quant || self.block_shape.is_some() {
            return Err(MoeError::Configuration(
                "per_channel_quant/block_shape given without a quantized precision".to_string(),
            ));
        }
        Ok(QuantMode::Full)
    }
}
