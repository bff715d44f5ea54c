use crate::arena::{
    ArenaLayout, EVICT_COMPARE_OFFSET, EVICT_PROBE_ONE_OFFSET, EVICT_PROBE_ZERO_OFFSET,
};
use crate::{CellAccess, PAGE_CELLS};
use core::ops::Range;

/// Evicts the compare and probe set classes by contention.
///
/// One page of the flush region is touched per step, at the three in-page
/// offsets matching the compare region and both probe halves. The target
/// regions themselves are never accessed.
#[derive(Debug, Clone)]
pub struct CacheEvictor {
    region: Range<usize>,
}

impl CacheEvictor {
    pub fn new(layout: &ArenaLayout) -> CacheEvictor {
        CacheEvictor {
            region: layout.flush(),
        }
    }

    /// Returns the wrapping sum of the touched cells, for the caller to fold
    /// into an observed checksum.
    pub fn flush<A: CellAccess + ?Sized>(&self, access: &mut A, cells: &[u32]) -> u64 {
        let mut sum = 0u64;
        for page in self.region.clone().step_by(PAGE_CELLS) {
            sum = sum.wrapping_add(access.load(cells, page + EVICT_COMPARE_OFFSET) as u64);
            sum = sum.wrapping_add(access.load(cells, page + EVICT_PROBE_ONE_OFFSET) as u64);
            sum = sum.wrapping_add(access.load(cells, page + EVICT_PROBE_ZERO_OFFSET) as u64);
        }
        sum
    }
}
