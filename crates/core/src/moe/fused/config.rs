//! Tile configuration for the grouped MoE GEMM.
//!
//! A [`KernelConfig`] is what tuned config files store per batch size. Before
//! launch it is resolved into a [`TileShape`] with every block size filled in.

use serde::{Deserialize, Serialize};

use crate::quantization::{BlockShape, QuantMode};

fn default_group_size_m() -> usize {
    1
}

fn default_num_warps() -> usize {
    4
}

fn default_num_stages() -> usize {
    3
}

/// Block size configuration for one grouped GEMM launch.
///
/// Field names follow the tuned JSON files (`BLOCK_SIZE_M`, ...). `N` and `K`
/// may be absent for weight-only modes, which pick them per problem shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Block size for the M dimension (sorted token rows).
    #[serde(rename = "BLOCK_SIZE_M")]
    pub block_size_m: usize,
    /// Block size for the N dimension (output features).
    #[serde(rename = "BLOCK_SIZE_N", default, skip_serializing_if = "Option::is_none")]
    pub block_size_n: Option<usize>,
    /// Block size for the K dimension (reduction).
    #[serde(rename = "BLOCK_SIZE_K", default, skip_serializing_if = "Option::is_none")]
    pub block_size_k: Option<usize>,
    /// Row tiles per band in the grouped tile ordering.
    #[serde(rename = "GROUP_SIZE_M", default = "default_group_size_m")]
    pub group_size_m: usize,
    #[serde(default = "default_num_warps")]
    pub num_warps: usize,
    #[serde(default = "default_num_stages")]
    pub num_stages: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::large_batch()
    }
}

impl KernelConfig {
    /// Configuration for batches no larger than the expert count.
    pub fn small_batch() -> Self {
        Self {
            block_size_m: 16,
            block_size_n: Some(32),
            block_size_k: Some(64),
            group_size_m: 1,
            num_warps: 4,
            num_stages: 3,
        }
    }

    /// Configuration for batches larger than the expert count.
    pub fn large_batch() -> Self {
        Self {
            block_size_m: 64,
            block_size_n: Some(64),
            block_size_k: Some(32),
            group_size_m: 8,
            num_warps: 4,
            num_stages: 3,
        }
    }

    /// Row-only configuration used by weight-only modes; N and K are chosen
    /// at launch by [`weight_only_block_config`].
    fn rows_only(block_size_m: usize) -> Self {
        Self {
            block_size_m,
            block_size_n: None,
            block_size_k: None,
            group_size_m: 1,
            num_warps: 4,
            num_stages: 3,
        }
    }
}

/// Problem dimensions of one grouped GEMM launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    /// `rows * top_k` (token, slot) pairs being multiplied.
    pub num_valid_tokens: usize,
    /// Output width.
    pub n: usize,
    /// Reduction width.
    pub k: usize,
    /// Local expert count of the weight stack.
    pub num_experts: usize,
    pub top_k: usize,
}

/// Fully resolved tile sizes used by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    pub block_m: usize,
    pub block_n: usize,
    pub block_k: usize,
    pub group_m: usize,
}

impl TileShape {
    /// Resolve `config` for `mode` and the given problem.
    ///
    /// Weight-only modes fill missing N/K from [`weight_only_block_config`].
    /// Block-wise modes clamp K to a divisor of `block_k` no larger than
    /// `min(block_n, block_k)`, so each K step stays inside one scale block.
    pub fn resolve(config: &KernelConfig, mode: &QuantMode, dims: &GemmDims) -> Self {
        let mut block_n = config.block_size_n;
        let mut block_k = config.block_size_k;

        if let Some(group_size) = mode.group_size() {
            if let Some((n, k)) = weight_only_block_config(config, mode, dims, group_size) {
                block_n = Some(n);
                block_k = Some(k);
            }
        }

        let block_n = block_n.unwrap_or(64).max(1);
        let mut block_k = block_k.unwrap_or(32).max(1);

        if let QuantMode::Fp8Block(shape) | QuantMode::Int8Block(shape) = mode {
            let cap = block_k.min(shape.block_n.min(shape.block_k)).max(1);
            block_k = largest_divisor_at_most(shape.block_k, cap);
        }

        Self {
            block_m: config.block_size_m.max(1),
            block_n,
            block_k,
            group_m: config.group_size_m.max(1),
        }
    }
}

fn largest_divisor_at_most(value: usize, cap: usize) -> usize {
    (1..=cap.min(value)).rev().find(|d| value % d == 0).unwrap_or(1)
}

/// Heuristic configuration when no tuned table entry exists.
///
/// # Arguments
/// * `m` - Tokens in the chunk
/// * `num_experts` - Expert count `E`
/// * `n`, `k` - First-GEMM output width and hidden size
/// * `dtype` - Config dtype tag (`fp8_w8a8`, `int4_w4a16`, ...)
/// * `block_shape` - Quantization block shape; weight-only modes use `[0, group]`
pub fn default_config(
    m: usize,
    num_experts: usize,
    _n: usize,
    _k: usize,
    top_k: usize,
    dtype: Option<&str>,
    block_shape: Option<BlockShape>,
) -> KernelConfig {
    match (dtype, block_shape) {
        (Some("fp8_w8a8"), Some(shape)) => KernelConfig {
            block_size_m: 64,
            block_size_n: Some(shape.block_n),
            block_size_k: Some(shape.block_k),
            group_size_m: 32,
            num_warps: 4,
            num_stages: 3,
        },
        (Some(tag @ ("int4_w4a16" | "int8_w8a16")), Some(shape)) => {
            let bits = if tag == "int4_w4a16" { 4 } else { 8 };
            if prefers_wide_weight_only_tiles(m * top_k, shape.block_k, num_experts, bits) {
                KernelConfig::rows_only(m.clamp(1, 16))
            } else if m <= 20 {
                KernelConfig::rows_only(16)
            } else if m <= 40 {
                KernelConfig::rows_only(32)
            } else {
                KernelConfig::rows_only(64)
            }
        }
        _ if m <= num_experts => KernelConfig::small_batch(),
        _ => KernelConfig::large_batch(),
    }
}

/// Whether a weight-only problem is sparse enough per expert to prefer the
/// wide N/K tiles.
pub fn prefers_wide_weight_only_tiles(
    num_valid_tokens: usize,
    group_size: usize,
    num_experts: usize,
    bits: u32,
) -> bool {
    bits == 4
        && matches!(group_size, 32 | 64 | 128)
        && (num_valid_tokens as f64) / (num_experts.max(1) as f64) <= 6.0
}

/// `(BLOCK_SIZE_N, BLOCK_SIZE_K)` for a weight-only launch, or `None` when
/// `config` already carries both.
pub fn weight_only_block_config(
    config: &KernelConfig,
    mode: &QuantMode,
    dims: &GemmDims,
    group_size: usize,
) -> Option<(usize, usize)> {
    if config.block_size_n.is_some() && config.block_size_k.is_some() {
        return None;
    }

    let bits = mode.weight_bits();
    let nvt = dims.num_valid_tokens;
    if !prefers_wide_weight_only_tiles(nvt, group_size, dims.num_experts, bits) {
        // single-token batches
        return Some(if nvt / dims.top_k.max(1) == 1 {
            (32, 64)
        } else {
            (64, 32)
        });
    }

    let block_m = config.block_size_m as f64;
    let mut block_n = 128usize;
    let mut block_k = 128usize;
    if block_k <= group_size {
        block_k = group_size;
    }

    let n_blocks = (dims.k / block_k) as f64;
    let k_blocks = (dims.n / block_k) as f64;
    let mut m_blocks = ((nvt as f64 + block_m - 1.0) / block_m).floor() + dims.num_experts as f64;
    if (nvt / dims.top_k.max(1)) as f64 <= block_m {
        m_blocks = m_blocks.min(nvt as f64);
    }
    let mut num_blocks = m_blocks * n_blocks * k_blocks;

    // the tile count is kept from the 128-wide estimate
    if dims.k % 256 == 0 && num_blocks >= 256.0 && block_k < 256 {
        block_k = 256;
    }

    if m_blocks <= 16.0
        && dims.k % (block_k * 2) == 0
        && block_k <= 512
        && num_blocks >= 512.0
    {
        block_k *= 2;
        num_blocks /= 2.0;
    }

    if num_blocks > 1024.0 {
        block_n = 256;
        num_blocks /= 2.0;
    }

    if dims.n <= 1024 && num_blocks >= 1024.0 {
        block_n = 1024;
    }

    Some((block_n, block_k))
}

/// Name of the tuned config file for one problem family.
///
/// `E={E},N={N},device_name={dev}[,dtype={dtype}][,block_shape=[bn,bk]].json`.
/// The block shape is only part of the name when both entries are non-zero.
pub fn config_file_name(
    num_experts: usize,
    n: usize,
    device_name: &str,
    dtype: Option<&str>,
    block_shape: Option<BlockShape>,
) -> String {
    let device_name = device_name.replace(' ', "_");
    let dtype_selector = dtype.map(|d| format!(",dtype={d}")).unwrap_or_default();
    let block_selector = match block_shape {
        Some(shape) if shape.block_n > 0 && shape.block_k > 0 => {
            format!(",block_shape=[{},{}]", shape.block_n, shape.block_k)
        }
        _ => String::new(),
    };
    format!("E={num_experts},N={n},device_name={device_name}{dtype_selector}{block_selector}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(num_valid_tokens: usize, n: usize, k: usize, num_experts: usize, top_k: usize) -> GemmDims {
        GemmDims {
            num_valid_tokens,
            n,
            k,
            num_experts,
            top_k,
        }
    }

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.block_size_m, 64);
        assert_eq!(config.block_size_n, Some(64));
        assert_eq!(config.block_size_k, Some(32));
        assert_eq!(config.group_size_m, 8);
    }

    #[test]
    fn test_small_vs_large_batch_branch() {
        let small = default_config(4, 8, 512, 256, 2, None, None);
        assert_eq!(small, KernelConfig::small_batch());
        let boundary = default_config(8, 8, 512, 256, 2, None, None);
        assert_eq!(boundary.block_size_m, 16);
        let large = default_config(9, 8, 512, 256, 2, None, None);
        assert_eq!(large.block_size_m, 64);
        assert_eq!(large.group_size_m, 8);
    }

    #[test]
    fn test_fp8_block_default() {
        let config = default_config(
            1,
            8,
            256,
            256,
            2,
            Some("fp8_w8a8"),
            Some(BlockShape::new(128, 128)),
        );
        assert_eq!(config.block_size_m, 64);
        assert_eq!(config.block_size_n, Some(128));
        assert_eq!(config.block_size_k, Some(128));
        assert_eq!(config.group_size_m, 32);
    }

    #[test]
    fn test_weight_only_defaults() {
        let shape = Some(BlockShape::new(0, 128));
        // 4-bit, 2 tokens * 2 slots over 8 experts -> wide tiles
        let wide = default_config(2, 8, 256, 256, 2, Some("int4_w4a16"), shape);
        assert_eq!(wide.block_size_m, 2);
        assert_eq!(wide.block_size_n, None);

        let small = default_config(10, 2, 256, 256, 2, Some("int4_w4a16"), shape);
        assert_eq!(small.block_size_m, 16);
        let mid = default_config(30, 2, 256, 256, 2, Some("int8_w8a16"), shape);
        assert_eq!(mid.block_size_m, 32);
        let big = default_config(100, 2, 256, 256, 2, Some("int8_w8a16"), shape);
        assert_eq!(big.block_size_m, 64);
        assert_eq!(big.group_size_m, 1);
    }

    #[test]
    fn test_prefers_wide_tiles() {
        assert!(prefers_wide_weight_only_tiles(48, 128, 8, 4));
        assert!(!prefers_wide_weight_only_tiles(49, 128, 8, 4));
        assert!(!prefers_wide_weight_only_tiles(8, 128, 8, 8));
        assert!(!prefers_wide_weight_only_tiles(8, 96, 8, 4));
    }

    #[test]
    fn test_weight_only_block_config_narrow() {
        let mode = QuantMode::Int8WeightOnly { group_size: 64 };
        let config = KernelConfig::rows_only(16);
        assert_eq!(
            weight_only_block_config(&config, &mode, &dims(2, 256, 256, 4, 2), 64),
            Some((32, 64))
        );
        assert_eq!(
            weight_only_block_config(&config, &mode, &dims(8, 256, 256, 4, 2), 64),
            Some((64, 32))
        );
    }

    #[test]
    fn test_weight_only_block_config_wide() {
        let mode = QuantMode::Int4WeightOnly { group_size: 128 };
        let config = KernelConfig::rows_only(1);
        // 1 token, top_k 2, 8 experts: m_blocks = min(2 + 8, 2) = 2
        let (n, k) =
            weight_only_block_config(&config, &mode, &dims(2, 8192, 4096, 8, 2), 128).unwrap();
        // 2 * 32 * 64 = 4096 tiles -> K 256 -> K 512 (2048 tiles) -> N 256
        assert_eq!((n, k), (256, 512));

        let (n, k) =
            weight_only_block_config(&config, &mode, &dims(2, 4096, 4096, 8, 2), 128).unwrap();
        // K 512 halves 2048 tiles to exactly 1024, not enough for N 256
        assert_eq!((n, k), (128, 512));

        let (n, k) =
            weight_only_block_config(&config, &mode, &dims(2, 256, 256, 8, 2), 128).unwrap();
        assert_eq!((n, k), (128, 128));
    }

    #[test]
    fn test_weight_only_keeps_explicit_sizes() {
        let mode = QuantMode::Int4WeightOnly { group_size: 128 };
        let config = KernelConfig::small_batch();
        assert_eq!(
            weight_only_block_config(&config, &mode, &dims(2, 256, 256, 8, 2), 128),
            None
        );
    }

    #[test]
    fn test_tile_shape_clamps_block_k() {
        let mode = QuantMode::Fp8Block(BlockShape::new(16, 48));
        let config = KernelConfig::small_batch();
        let tile = TileShape::resolve(&config, &mode, &dims(4, 64, 96, 4, 2));
        // min(64, min(16, 48)) = 16 divides 48
        assert_eq!(tile.block_k, 16);

        let mode = QuantMode::Fp8Block(BlockShape::new(64, 48));
        let tile = TileShape::resolve(&config, &mode, &dims(4, 64, 96, 4, 2));
        // cap 48, largest divisor of 48 not above 48
        assert_eq!(tile.block_k, 48);

        let mode = QuantMode::Int8Block(BlockShape::new(128, 24));
        let tile = TileShape::resolve(&KernelConfig::large_batch(), &mode, &dims(4, 128, 48, 4, 2));
        assert_eq!(tile.block_k, 24);
        assert_eq!(tile.block_n, 64);
    }

    #[test]
    fn test_tile_shape_fills_weight_only_sizes() {
        let mode = QuantMode::Int8WeightOnly { group_size: 32 };
        let config = default_config(1, 4, 64, 64, 2, Some("int8_w8a16"), mode.block_shape());
        let tile = TileShape::resolve(&config, &mode, &dims(2, 64, 64, 4, 2));
        assert_eq!(tile.block_m, 16);
        // one token per slot
        assert_eq!((tile.block_n, tile.block_k), (32, 64));
    }

    #[test]
    fn test_config_file_name() {
        assert_eq!(
            config_file_name(8, 14336, "NVIDIA H100 80GB HBM3", None, None),
            "E=8,N=14336,device_name=NVIDIA_H100_80GB_HBM3.json"
        );
        assert_eq!(
            config_file_name(
                256,
                256,
                "dev",
                Some("fp8_w8a8"),
                Some(BlockShape::new(128, 128))
            ),
            "E=256,N=256,device_name=dev,dtype=fp8_w8a8,block_shape=[128,128].json"
        );
        assert_eq!(
            config_file_name(8, 64, "dev", Some("int4_w4a16"), Some(BlockShape::new(0, 128))),
            "E=8,N=64,device_name=dev,dtype=int4_w4a16.json"
        );
    }

    #[test]
    fn test_kernel_config_serde() {
        let json = r#"{"BLOCK_SIZE_M": 16, "BLOCK_SIZE_N": 32, "BLOCK_SIZE_K": 64,
                       "GROUP_SIZE_M": 1, "num_warps": 4, "num_stages": 4}"#;
        let config: KernelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.block_size_m, 16);
        assert_eq!(config.block_size_k, Some(64));
        assert_eq!(config.num_stages, 4);

        let partial: KernelConfig = serde_json::from_str(r#"{"BLOCK_SIZE_M": 32}"#).unwrap();
        assert_eq!(partial.block_size_n, None);
        assert_eq!(partial.group_size_m, 1);
        assert_eq!(partial.num_warps, 4);
    }
}
