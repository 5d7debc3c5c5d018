//! Token grouping for fused MoE execution.
//!
//! Every `(token, slot)` pair is assigned to its expert, the pairs are laid
//! out expert by expert and each expert's run is padded up to a multiple of
//! the GEMM row block size, so every row tile of the grouped GEMM belongs to
//! exactly one expert.

use candle_core::{DType, Tensor};

use crate::error::{ensure, Result};
use crate::moe::expert_map::{ExpertMap, ExpertSlot};

/// Expert-sorted, block-padded layout of the flattened `[M * top_k]` routing
/// assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedTokenPermutation {
    /// Flat `(token * top_k + slot)` index per sorted position. Padding holds
    /// `num_valid_tokens`. Length is the worst-case padded size
    /// `M * top_k + E * (block_size - 1)`.
    pub sorted_token_ids: Vec<usize>,
    /// Expert per row block, for the first
    /// `num_tokens_post_padded / block_size` blocks.
    pub expert_ids: Vec<ExpertSlot>,
    /// Used prefix of `sorted_token_ids`, a multiple of `block_size`.
    pub num_tokens_post_padded: usize,
    /// `M * top_k`.
    pub num_valid_tokens: usize,
    pub block_size: usize,
}

impl SortedTokenPermutation {
    /// Expert of the row block starting at sorted position `row_start`;
    /// `None` past `num_tokens_post_padded`.
    #[inline]
    pub fn block_expert(&self, row_start: usize) -> Option<ExpertSlot> {
        if row_start >= self.num_tokens_post_padded {
            return None;
        }
        self.expert_ids.get(row_start / self.block_size).copied()
    }

    /// Number of sorted positions that hold a real `(token, slot)` pair.
    pub fn num_assigned(&self) -> usize {
        self.sorted_token_ids[..self.num_tokens_post_padded]
            .iter()
            .filter(|&&id| id < self.num_valid_tokens)
            .count()
    }
}

/// Token grouper that aligns tokens by expert for batched execution.
#[derive(Debug, Clone, Copy)]
pub struct MoeTokenGrouper {
    block_size: usize,
    num_experts: usize,
}

impl MoeTokenGrouper {
    pub fn new(block_size: usize, num_experts: usize) -> Self {
        Self {
            block_size,
            num_experts,
        }
    }

    /// Align a `[M, top_k]` U32 id tensor.
    pub fn align_block_size(
        &self,
        topk_ids: &Tensor,
        expert_map: Option<&ExpertMap>,
    ) -> Result<SortedTokenPermutation> {
        let (_num_tokens, _top_k) = topk_ids.dims2()?;
        let ids: Vec<u32> = topk_ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
        self.align_ids(&ids, expert_map)
    }

    /// Align flattened `[M * top_k]` global expert ids.
    ///
    /// 1. Count pairs per expert
    /// 2. Pad each count to a block multiple and take the prefix sum
    /// 3. Scatter pair indices to their sorted positions, in ascending order
    ///    within each expert
    /// 4. Record the (local) expert of every block
    pub fn align_ids(
        &self,
        ids: &[u32],
        expert_map: Option<&ExpertMap>,
    ) -> Result<SortedTokenPermutation> {
        let block_size = self.block_size;
        let num_experts = self.num_experts;
        ensure!(block_size > 0, "block_size must be > 0");
        ensure!(num_experts > 0, "num_experts must be > 0");
        if let Some(map) = expert_map {
            ensure!(
                map.num_experts() == num_experts,
                "expert map covers {} experts, expected {num_experts}",
                map.num_experts()
            );
        }

        let numel = ids.len();
        let max_num_tokens_padded = numel + num_experts * (block_size - 1);

        let mut expert_counts = vec![0usize; num_experts];
        for &expert_id in ids {
            let expert = expert_id as usize;
            ensure!(
                expert < num_experts,
                "expert id {expert} out of range for {num_experts} experts"
            );
            expert_counts[expert] += 1;
        }

        let mut cumsum = vec![0usize; num_experts + 1];
        for (i, &count) in expert_counts.iter().enumerate() {
            cumsum[i + 1] = cumsum[i] + count.div_ceil(block_size) * block_size;
        }
        let num_tokens_post_padded = cumsum[num_experts];

        let mut sorted_token_ids = vec![numel; max_num_tokens_padded];
        let mut offsets = cumsum[..num_experts].to_vec();
        for (pair, &expert_id) in ids.iter().enumerate() {
            let pos = &mut offsets[expert_id as usize];
            sorted_token_ids[*pos] = pair;
            *pos += 1;
        }

        let mut expert_ids = Vec::with_capacity(num_tokens_post_padded / block_size);
        for expert in 0..num_experts {
            let blocks = (cumsum[expert + 1] - cumsum[expert]) / block_size;
            let slot = match expert_map {
                Some(map) => map.slot(expert),
                None => ExpertSlot::Local(expert),
            };
            expert_ids.extend(std::iter::repeat(slot).take(blocks));
        }

        Ok(SortedTokenPermutation {
            sorted_token_ids,
            expert_ids,
            num_tokens_post_padded,
            num_valid_tokens: numel,
            block_size,
        })
    }
}

/// Sort and pad `topk_ids` (`[M, top_k]`, U32 global ids) by expert.
///
/// With an `expert_map`, blocks of experts not stored on this shard are
/// marked [`ExpertSlot::Absent`] and the remaining ids are translated to
/// local weight indices.
pub fn moe_align_block_size(
    topk_ids: &Tensor,
    block_size: usize,
    num_experts: usize,
    expert_map: Option<&ExpertMap>,
) -> Result<SortedTokenPermutation> {
    MoeTokenGrouper::new(block_size, num_experts).align_block_size(topk_ids, expert_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moe::ExpertPlacement;
    use crate::MoeError;
    use candle_core::Device;

    #[test]
    fn test_token_grouper_basic() {
        let device = Device::Cpu;
        // Token 0 -> experts [2, 3]
        // Token 1 -> experts [1, 2]
        // Token 2 -> experts [1, 3]
        // Token 3 -> experts [1, 2]
        let topk_ids = Tensor::new(&[[2u32, 3], [1, 2], [1, 3], [1, 2]], &device).unwrap();
        let aligned = moe_align_block_size(&topk_ids, 4, 4, None).unwrap();

        // expert 1: 3 pairs, expert 2: 3 pairs, expert 3: 2 pairs, each padded to 4
        assert_eq!(aligned.num_tokens_post_padded, 12);
        assert_eq!(aligned.num_valid_tokens, 8);
        assert_eq!(aligned.sorted_token_ids.len(), 8 + 4 * 3);
        assert_eq!(
            aligned.expert_ids,
            vec![ExpertSlot::Local(1), ExpertSlot::Local(2), ExpertSlot::Local(3)]
        );
        assert_eq!(&aligned.sorted_token_ids[..4], &[2, 4, 6, 8]);
        assert_eq!(&aligned.sorted_token_ids[4..8], &[0, 3, 7, 8]);
        assert_eq!(&aligned.sorted_token_ids[8..12], &[1, 5, 8, 8]);
        assert!(aligned.sorted_token_ids[12..].iter().all(|&id| id == 8));
        assert_eq!(aligned.num_assigned(), 8);
    }

    #[test]
    fn test_every_pair_appears_once() {
        let ids: Vec<u32> = vec![0, 3, 3, 1, 2, 0, 3, 3, 1, 1, 0, 2];
        let aligned = MoeTokenGrouper::new(3, 4).align_ids(&ids, None).unwrap();
        let mut seen: Vec<usize> = aligned.sorted_token_ids[..aligned.num_tokens_post_padded]
            .iter()
            .copied()
            .filter(|&id| id < ids.len())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..ids.len()).collect::<Vec<_>>());
        assert_eq!(aligned.num_tokens_post_padded % 3, 0);

        // each block's pairs all belong to the block's expert
        for (block, slot) in aligned.expert_ids.iter().enumerate() {
            let expert = slot.local().unwrap();
            for &id in &aligned.sorted_token_ids[block * 3..(block + 1) * 3] {
                if id < ids.len() {
                    assert_eq!(ids[id] as usize, expert);
                }
            }
        }
    }

    #[test]
    fn test_block_expert_past_padding() {
        let ids = vec![0u32, 1];
        let aligned = MoeTokenGrouper::new(2, 2).align_ids(&ids, None).unwrap();
        assert_eq!(aligned.num_tokens_post_padded, 4);
        assert_eq!(aligned.block_expert(0), Some(ExpertSlot::Local(0)));
        assert_eq!(aligned.block_expert(2), Some(ExpertSlot::Local(1)));
        assert_eq!(aligned.block_expert(4), None);
    }

    #[test]
    fn test_expert_map_translates_and_marks_absent() {
        let map = ExpertMap::new(4, 2, 1, ExpertPlacement::Linear).unwrap();
        let ids = vec![0u32, 2, 3, 2];
        let aligned = MoeTokenGrouper::new(2, 4).align_ids(&ids, Some(&map)).unwrap();
        assert_eq!(
            aligned.expert_ids,
            vec![ExpertSlot::Absent, ExpertSlot::Local(0), ExpertSlot::Local(1)]
        );
    }

    #[test]
    fn test_out_of_range_id() {
        let err = MoeTokenGrouper::new(4, 2).align_ids(&[0, 5], None).unwrap_err();
        assert!(matches!(err, MoeError::PreconditionViolation(_)));
    }
}
