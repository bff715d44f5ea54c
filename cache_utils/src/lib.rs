#![deny(unsafe_op_in_unsafe_fn)]

use static_assertions::const_assert_eq;

pub mod arena;
pub mod eviction;
pub mod mmap;
pub mod ticks;

use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

pub const PAGE_LEN: usize = 1 << 12;
pub const CACHE_LINE_LEN: usize = 64;
pub const CELL_LEN: usize = core::mem::size_of::<u32>();

// Arena offsets are expressed in u32 cells.
pub const PAGE_CELLS: usize = PAGE_LEN / CELL_LEN;
pub const LINE_CELLS: usize = CACHE_LINE_LEN / CELL_LEN;

const_assert_eq!(PAGE_CELLS, 1024);
const_assert_eq!(LINE_CELLS, 16);

pub unsafe fn maccess<T>(p: *const T) -> T {
    unsafe { ptr::read_volatile(p) }
}

// Keeps the compiler from moving loads across a timing point.
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Memory accesses to the arena cells.
///
/// Everything that touches the arena during a trial (eviction, chain walks,
/// the gadget) goes through this trait so that the same trial code drives
/// both real memory and the simulated core.
pub trait CellAccess {
    fn load(&mut self, cells: &[u32], index: usize) -> u32;
}

/// Plain volatile loads on real memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolatileAccess;

impl CellAccess for VolatileAccess {
    #[inline(always)]
    fn load(&mut self, cells: &[u32], index: usize) -> u32 {
        // Safety: the reference is valid, the bound check happened on indexing.
        unsafe { maccess(&cells[index]) }
    }
}

/// Follows the pointer chain starting at `start` until the index leaves
/// `[.., end)`. Every hop depends on the previous load, so hops cannot be
/// overlapped or prefetched.
///
/// Returns the final index, which callers fold into their checksum.
pub fn walk_chain<A: CellAccess + ?Sized>(
    access: &mut A,
    cells: &[u32],
    start: usize,
    end: usize,
) -> usize {
    let mut idx = start;
    while idx < end {
        idx = access.load(cells, idx) as usize;
    }
    idx
}
