//! Intermediate buffers of the fused MoE forward.
//!
//! The GEMM1 output (`[pairs, N]`) and the GEMM2 output (`[pairs, K]`) share
//! one allocation of `pairs * max(N, K)` values: the GEMM1 output is dead by
//! the time GEMM2 writes. The gated activation output (`[pairs, N / 2]`)
//! lives in its own buffer because it is read while GEMM2 writes.

/// Reusable scratch for one forward call, sized for the largest chunk.
#[derive(Debug)]
pub struct ScratchArena {
    cache13: Vec<f32>,
    cache2: Vec<f32>,
    max_pairs: usize,
    n: usize,
    k: usize,
}

impl ScratchArena {
    /// Scratch for up to `max_pairs` `(token, slot)` rows with GEMM1 width
    /// `n` and hidden size `k`.
    pub fn new(max_pairs: usize, n: usize, k: usize) -> Self {
        Self {
            cache13: vec![0.0; max_pairs * n.max(k)],
            cache2: vec![0.0; max_pairs * (n / 2)],
            max_pairs,
            n,
            k,
        }
    }

    pub fn max_pairs(&self) -> usize {
        self.max_pairs
    }

    /// Total number of `f32` values held.
    pub fn len(&self) -> usize {
        self.cache13.len() + self.cache2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// GEMM1 output `[pairs, N]`.
    pub fn gemm1_output(&mut self, pairs: usize) -> &mut [f32] {
        debug_assert!(pairs <= self.max_pairs);
        &mut self.cache13[..pairs * self.n]
    }

    /// GEMM1 output to read and activation output `[pairs, N / 2]` to write.
    pub fn activation_io(&mut self, pairs: usize) -> (&[f32], &mut [f32]) {
        debug_assert!(pairs <= self.max_pairs);
        (
            &self.cache13[..pairs * self.n],
            &mut self.cache2[..pairs * (self.n / 2)],
        )
    }

    /// Activation output `[pairs, N / 2]`, the GEMM2 input.
    pub fn activation_output(&self, pairs: usize) -> &[f32] {
        &self.cache2[..pairs * (self.n / 2)]
    }

    /// GEMM2 output `[pairs, K]`, reusing the GEMM1 region.
    pub fn gemm2_output(&mut self, pairs: usize) -> &mut [f32] {
        debug_assert!(pairs <= self.max_pairs);
        &mut self.cache13[..pairs * self.k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let arena = ScratchArena::new(6, 8, 16);
        assert_eq!(arena.len(), 6 * 16 + 6 * 4);
        assert_eq!(arena.max_pairs(), 6);

        let arena = ScratchArena::new(6, 32, 16);
        assert_eq!(arena.len(), 6 * 32 + 6 * 16);
    }

    #[test]
    fn test_regions_follow_phase_order() {
        let mut arena = ScratchArena::new(2, 4, 3);
        arena.gemm1_output(2).copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        {
            let (input, output) = arena.activation_io(2);
            assert_eq!(input[4], 5.0);
            output.copy_from_slice(&[9.0, 10.0, 11.0, 12.0]);
        }
        // GEMM2 overwrites the GEMM1 region, the activation output survives.
        arena.gemm2_output(2).fill(0.5);
        assert_eq!(arena.activation_output(2), &[9.0, 10.0, 11.0, 12.0]);
        assert_eq!(arena.gemm2_output(1).len(), 3);
    }
}
