//! Mixture of Experts (MoE) execution.
//!
//! ## Submodules
//!
//! - [`router`]: top-k and grouped top-k routing
//! - [`topk_softmax`]: softmax top-k selection over gate logits
//! - [`expert_map`]: global to local expert placement for expert parallelism
//! - [`fused`]: the fused grouped GEMM pipeline

pub mod expert_map;
pub mod fused;
pub mod router;
pub mod topk_softmax;

pub use expert_map::{ExpertMap, ExpertPlacement, ExpertSlot};
pub use fused::{fused_experts, fused_moe, FusedMoeParams, MoeConfigCache, RoutingInput};
pub use router::{grouped_topk, RoutingFunction, RoutingMethod, ScoringFunc};
pub use topk_softmax::fused_topk;
