//! Fused MoE expert execution.
//!
//! ```text
//!  topk ids ──▶ align (sort by expert, pad to BLOCK_SIZE_M)
//!                  │
//!  hidden ──▶ quantize ──▶ GEMM1 (gate/up) ──▶ act_and_mul ──▶ quantize
//!                                                                │
//!  output ◀── sum over top-k ◀── GEMM2 (down, * router weight) ◀─┘
//! ```
//!
//! - [`config`]: tile configuration and shape heuristics
//! - [`config_cache`]: tuned per-shape tables loaded from JSON files
//! - [`token_grouper`]: token/expert alignment
//! - [`kernel`]: the grouped tiled GEMM
//! - [`pipeline`]: chunked end-to-end forward

pub mod activation;
pub mod config;
pub mod config_cache;
pub mod kernel;
pub mod pipeline;
mod reduce;
mod scratch;
pub mod token_grouper;

pub use activation::Activation;
pub use config::{
    config_file_name, default_config, prefers_wide_weight_only_tiles, weight_only_block_config,
    GemmDims, KernelConfig, TileShape,
};
pub use config_cache::{ConfigTable, MoeConfigCache};
pub use kernel::{invoke_fused_moe_kernel, tile_coords, MoeGemmArgs, TileOutput};
pub use pipeline::{fused_experts, fused_moe, FusedMoeParams, RoutingInput, DEFAULT_CHUNK_SIZE};
pub use reduce::{moe_sum, moe_sum_into};
pub use scratch::ScratchArena;
pub use token_grouper::{moe_align_block_size, MoeTokenGrouper, SortedTokenPermutation};
