//! Placement of experts across expert-parallel shards.
//!
//! Routing produces global expert ids; each shard stores only a subset of
//! the expert weights and indexes them with local ids. An [`ExpertMap`]
//! translates between the two. Global ids stored elsewhere resolve to
//! [`ExpertSlot::Absent`] and their rows of the grouped GEMM are written as
//! zeros, so summing the outputs of all shards gives the full layer.
//!
//! Built-in placements over `ep_size` shards:
//!
//! - `Linear`: shard `r` owns the contiguous range `[r * L, (r + 1) * L)`
//!   with `L = num_experts / ep_size`.
//! - `RoundRobin`: shard `r` owns `r, r + ep_size, r + 2 * ep_size, ...`.
//! - `Explicit`: any global -> local table, e.g. read from a checkpoint.
//!
//! ```
//! use fused_moe_core::moe::{ExpertMap, ExpertPlacement, ExpertSlot};
//!
//! // shard 0 of 2 holds experts 0..4
//! let map = ExpertMap::new(8, 2, 0, ExpertPlacement::Linear).unwrap();
//! assert!(map.is_local(3));
//! assert_eq!(map.slot(2), ExpertSlot::Local(2));
//! assert_eq!(map.slot(4), ExpertSlot::Absent);
//! ```

use candle_core::{DType, Tensor};

use crate::error::{ensure, Result};

/// Expert a row tile computes with on this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpertSlot {
    /// Local weight index.
    Local(usize),
    /// Expert lives on another shard; the tile is zero-filled.
    Absent,
}

impl ExpertSlot {
    pub fn local(self) -> Option<usize> {
        match self {
            Self::Local(e) => Some(e),
            Self::Absent => None,
        }
    }
}

/// How experts are spread over shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpertPlacement {
    #[default]
    Linear,
    RoundRobin,
    /// Arbitrary table supplied by the caller.
    Explicit,
}

/// Global <-> local expert id translation for one shard.
#[derive(Debug, Clone)]
pub struct ExpertMap {
    /// Indexed by global id.
    locals: Vec<Option<usize>>,
    /// Indexed by local id.
    globals: Vec<usize>,
    ep_rank: usize,
    ep_size: usize,
    placement: ExpertPlacement,
}

impl ExpertMap {
    /// Map for shard `ep_rank` of `ep_size` under a built-in placement.
    /// `ep_size` must divide `num_experts`.
    pub fn new(
        num_experts: usize,
        ep_size: usize,
        ep_rank: usize,
        placement: ExpertPlacement,
    ) -> Result<Self> {
        ensure!(ep_size > 0, "ep_size must be > 0");
        ensure!(ep_rank < ep_size, "ep_rank ({ep_rank}) must be < ep_size ({ep_size})");
        ensure!(
            num_experts % ep_size == 0,
            "num_experts ({num_experts}) must be divisible by ep_size ({ep_size})"
        );
        ensure!(
            placement != ExpertPlacement::Explicit,
            "explicit placements are built with ExpertMap::from_table"
        );

        let per_shard = num_experts / ep_size;
        let globals: Vec<usize> = match placement {
            ExpertPlacement::Linear => (ep_rank * per_shard..(ep_rank + 1) * per_shard).collect(),
            _ => (ep_rank..num_experts).step_by(ep_size).collect(),
        };
        let mut locals = vec![None; num_experts];
        for (local, &global) in globals.iter().enumerate() {
            locals[global] = Some(local);
        }

        Ok(Self {
            locals,
            globals,
            ep_rank,
            ep_size,
            placement,
        })
    }

    /// All experts local, identity mapping.
    pub fn single_gpu(num_experts: usize) -> Self {
        Self {
            locals: (0..num_experts).map(Some).collect(),
            globals: (0..num_experts).collect(),
            ep_rank: 0,
            ep_size: 1,
            placement: ExpertPlacement::Linear,
        }
    }

    /// Build from an explicit global→local table. Local ids must be exactly
    /// `0..local_count`, each used once.
    pub fn from_table(locals: Vec<Option<usize>>) -> Result<Self> {
        let count = locals.iter().flatten().count();
        let mut globals = vec![usize::MAX; count];
        for (global, local) in locals.iter().enumerate() {
            if let Some(local) = *local {
                ensure!(
                    local < count && globals[local] == usize::MAX,
                    "expert map entry {global} -> {local} is out of range or duplicated"
                );
                globals[local] = global;
            }
        }
        Ok(Self {
            locals,
            globals,
            ep_rank: 0,
            ep_size: 1,
            placement: ExpertPlacement::Explicit,
        })
    }

    /// Build from an integer tensor `[num_experts]` where negative entries
    /// mark experts that are not on this shard.
    pub fn from_tensor(map: &Tensor) -> Result<Self> {
        ensure!(map.rank() == 1, "expert map must be 1-D, got {:?}", map.dims());
        let values = map.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        Self::from_table(
            values
                .into_iter()
                .map(|v| usize::try_from(v).ok())
                .collect(),
        )
    }

    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        self.to_local(global_id).is_some()
    }

    /// Local weight index of `global_id`, `None` when stored elsewhere or
    /// out of range.
    #[inline]
    pub fn to_local(&self, global_id: usize) -> Option<usize> {
        self.locals.get(global_id).copied().flatten()
    }

    /// Slot a global expert resolves to on this shard.
    #[inline]
    pub fn slot(&self, global_id: usize) -> ExpertSlot {
        match self.to_local(global_id) {
            Some(local) => ExpertSlot::Local(local),
            None => ExpertSlot::Absent,
        }
    }

    #[inline]
    pub fn to_global(&self, local_id: usize) -> Option<usize> {
        self.globals.get(local_id).copied()
    }

    /// Shard that stores `global_id`. Explicit tables only know whether this
    /// shard stores it.
    pub fn owner_rank(&self, global_id: usize) -> Option<usize> {
        if global_id >= self.num_experts() {
            return None;
        }
        match self.placement {
            ExpertPlacement::Linear => Some(global_id / self.local_num_experts().max(1)),
            ExpertPlacement::RoundRobin => Some(global_id % self.ep_size),
            ExpertPlacement::Explicit => self.is_local(global_id).then_some(self.ep_rank),
        }
    }

    /// Experts stored on this shard.
    pub fn local_num_experts(&self) -> usize {
        self.globals.len()
    }

    /// Experts across all shards.
    pub fn num_experts(&self) -> usize {
        self.locals.len()
    }

    pub fn ep_rank(&self) -> usize {
        self.ep_rank
    }

    pub fn ep_size(&self) -> usize {
        self.ep_size
    }

    pub fn placement(&self) -> ExpertPlacement {
        self.placement
    }

    /// Global ids stored here, in local order.
    pub fn stored_experts(&self) -> impl Iterator<Item = usize> + '_ {
        self.globals.iter().copied()
    }
}
