use crate::gadget::{GadgetCall, GadgetMode, SecretHolder, SpeculativePrimitives, WARM_CELL};
use cache_utils::arena::{ArenaLayout, HALF_PAGE_CELLS};

pub const TRAINING_ROUNDS: usize = 5;

/// Calls the gadget on the training regions so that its branch is
/// predicted taken on the next call.
///
/// Training reads bit 0 of the warm cell, which is always 0, so only the
/// first line of the training probe region is ever touched.
#[derive(Debug, Clone, Copy)]
pub struct BranchTrainer {
    call: GadgetCall,
}

impl BranchTrainer {
    pub fn new(layout: &ArenaLayout, mode: GadgetMode) -> BranchTrainer {
        BranchTrainer {
            call: GadgetCall {
                compare_index: layout.train_cmp_base,
                probe_base: layout.train_probe_base,
                probe_offset: 0,
                half_stride: layout.train_probe_size + HALF_PAGE_CELLS,
                read_index: WARM_CELL,
                bit: 0,
                mode,
            },
        }
    }

    pub fn call(&self) -> &GadgetCall {
        &self.call
    }

    pub fn train<P: SpeculativePrimitives + ?Sized>(
        &self,
        primitives: &mut P,
        cells: &[u32],
        secret: &SecretHolder,
    ) -> u64 {
        let mut sum = 0u64;
        for _ in 0..TRAINING_ROUNDS {
            sum = sum.wrapping_add(primitives.probe(cells, &self.call, secret) as u64);
        }
        sum
    }
}
