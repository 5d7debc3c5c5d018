//! Fused Mixture-of-Experts feed-forward execution.
//!
//! Tokens are routed to their top-k experts, permuted into expert-sorted
//! padded row tiles and pushed through two quantization-aware grouped GEMMs
//! with a gated activation in between. See [`moe::fused`] for the pipeline and
//! [`quantization`] for the supported weight/activation precisions.

pub mod error;
pub mod moe;
pub mod quantization;

pub use error::{MoeError, Result};
