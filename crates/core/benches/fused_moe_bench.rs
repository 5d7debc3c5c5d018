//! Criterion benchmarks for the fused MoE forward.
//!
//! Covers token alignment, the grouped GEMM for full-precision and quantized
//! weights, and the end-to-end chunked forward, all running on CPU.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use fused_moe_core::moe::{
    fused::{invoke_fused_moe_kernel, moe_align_block_size, KernelConfig, MoeGemmArgs},
    fused_experts, fused_topk, FusedMoeParams, MoeConfigCache,
};
use fused_moe_core::quantization::{
    quantize_expert_weights, BlockShape, ExpertWeights, QuantMode, QuantizedActivation,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const NUM_EXPERTS: usize = 8;
const TOP_K: usize = 2;
const HIDDEN: usize = 256;
const INTERMEDIATE: usize = 512;

/// Deterministic data of the given size, values in [-scale, scale].
fn make_data(n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.017).sin() * scale).collect()
}

fn make_tensor(shape: &[usize], scale: f32) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_vec(make_data(len, scale), shape, &Device::Cpu).expect("tensor")
}

fn make_routing(tokens: usize) -> (Tensor, Tensor) {
    let gating = make_tensor(&[tokens, NUM_EXPERTS], 3.0);
    fused_topk(&gating, TOP_K, true).expect("routing")
}

fn make_weights(mode: QuantMode) -> (ExpertWeights, ExpertWeights) {
    let w1 = make_tensor(&[NUM_EXPERTS, INTERMEDIATE * 2, HIDDEN], 0.05);
    let w2 = make_tensor(&[NUM_EXPERTS, HIDDEN, INTERMEDIATE], 0.05);
    (
        quantize_expert_weights(&w1, mode, false).expect("w1"),
        quantize_expert_weights(&w2, mode, false).expect("w2"),
    )
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

fn bench_align(c: &mut Criterion) {
    let mut group = c.benchmark_group("moe_align_block_size");
    for &tokens in &[16usize, 256, 4096] {
        let (_, ids) = make_routing(tokens);
        group.bench_with_input(BenchmarkId::from_parameter(tokens), &ids, |b, ids| {
            b.iter(|| moe_align_block_size(black_box(ids), 64, NUM_EXPERTS, None).expect("align"))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Grouped GEMM
// ---------------------------------------------------------------------------

fn bench_grouped_gemm(c: &mut Criterion) {
    let tokens = 64;
    let (weights, ids) = make_routing(tokens);
    let weights: Vec<f32> = weights.flatten_all().unwrap().to_vec1().expect("weights");
    let hidden = make_data(tokens * HIDDEN, 1.0);
    let config = KernelConfig::large_batch();
    let permutation =
        moe_align_block_size(&ids, config.block_size_m, NUM_EXPERTS, None).expect("align");

    let (w1, _) = make_weights(QuantMode::Full);
    let a = QuantizedActivation::full(hidden, tokens, HIDDEN).expect("activation");
    let mut out = vec![0f32; tokens * TOP_K * INTERMEDIATE * 2];

    c.bench_function("grouped_gemm_full_64tok", |b| {
        b.iter(|| {
            let args = MoeGemmArgs {
                a: &a,
                b: &w1,
                topk_weights: Some(&weights),
                permutation: &permutation,
                mul_routed_weight: false,
                top_k: TOP_K,
                config: &config,
                compute_dtype: candle_core::DType::F32,
            };
            invoke_fused_moe_kernel(black_box(&args), &mut out).expect("gemm")
        })
    });
}

// ---------------------------------------------------------------------------
// End-to-end forward
// ---------------------------------------------------------------------------

fn bench_forward(c: &mut Criterion) {
    let configs = MoeConfigCache::heuristic_only();
    let params = FusedMoeParams::default();
    let modes = [
        ("full", QuantMode::Full),
        ("fp8_block", QuantMode::Fp8Block(BlockShape::new(128, 128))),
        ("int8_channel", QuantMode::Int8Channel),
        ("int4_w4a16", QuantMode::Int4WeightOnly { group_size: 128 }),
    ];

    let mut group = c.benchmark_group("fused_experts");
    group.sample_size(10);
    for (name, mode) in modes {
        let (w1, w2) = make_weights(mode);
        for &tokens in &[1usize, 32] {
            let hidden = make_tensor(&[tokens, HIDDEN], 1.0);
            let (tw, ti) = make_routing(tokens);
            group.bench_with_input(
                BenchmarkId::new(name, tokens),
                &hidden,
                |b, hidden| {
                    b.iter(|| {
                        fused_experts(black_box(hidden), &w1, &w2, &tw, &ti, &params, &configs)
                            .expect("forward")
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_align, bench_grouped_gemm, bench_forward);
criterion_main!(benches);
