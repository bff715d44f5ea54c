//! Sub-region layout of the trial arena.
//!
//! All regions live inside one page-aligned allocation, so the low 12 bits
//! of every cell address are fixed by its offset alone. Cache sets are
//! selected by address bits 6 and up; bits 6..11 are the ones we control,
//! and each region is given its own value for them:
//!
//! | region           | in-page offset (bytes) | set class |
//! |------------------|------------------------|-----------|
//! | compare          | 0                      | 0         |
//! | probe, bit 0     | 1024                   | 16        |
//! | training         | 2048                   | 32        |
//! | probe, bit 1     | 3072                   | 48        |
//!
//! Every region walks its cells one page apart, so each region stays in its
//! own set class whatever its size.

use crate::mmap::MMappedMemory;
use crate::{LINE_CELLS, PAGE_CELLS};
use core::fmt;
use core::ops::Range;
use static_assertions::const_assert;
use thiserror::Error;

pub const QUARTER_PAGE_CELLS: usize = PAGE_CELLS / 4;
pub const HALF_PAGE_CELLS: usize = PAGE_CELLS / 2;

pub const TRAIN_PROBE_SIZE: usize = PAGE_CELLS;

// In-page offsets touched by the evictor, one per set class to evict.
pub const EVICT_COMPARE_OFFSET: usize = 0;
pub const EVICT_PROBE_ZERO_OFFSET: usize = QUARTER_PAGE_CELLS;
pub const EVICT_PROBE_ONE_OFFSET: usize = 3 * QUARTER_PAGE_CELLS;

const_assert!(EVICT_PROBE_ONE_OFFSET < PAGE_CELLS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Flush,
    Compare,
    ProbeZero,
    ProbeOne,
    TrainProbe,
    TrainCompare,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::Flush => "flush",
            Region::Compare => "compare",
            Region::ProbeZero => "probe (bit 0)",
            Region::ProbeOne => "probe (bit 1)",
            Region::TrainProbe => "training probe",
            Region::TrainCompare => "training compare",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{region} region size must be positive")]
    Empty { region: Region },
    #[error("{region} region size {size} is not a multiple of 1024 cells")]
    NotPageMultiple { region: Region, size: usize },
    #[error("arena of {total} cells does not fit 32 bit chain indices")]
    TooLarge { total: usize },
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("failed to map the arena: {0}")]
    Map(#[from] nix::Error),
}

/// Base offsets (in cells) of the arena regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    pub flush_base: usize,
    pub flush_size: usize,
    pub cmp_base: usize,
    pub cmp_size: usize,
    pub probe_base: usize,
    pub probe_size: usize,
    pub train_probe_base: usize,
    pub train_probe_size: usize,
    pub train_cmp_base: usize,
    pub total_size: usize,
}

fn check_size(region: Region, size: usize) -> Result<(), LayoutError> {
    if size == 0 {
        Err(LayoutError::Empty { region })
    } else if size % PAGE_CELLS != 0 {
        Err(LayoutError::NotPageMultiple { region, size })
    } else {
        Ok(())
    }
}

impl ArenaLayout {
    pub fn new(flush_size: usize, probe_size: usize) -> Result<ArenaLayout, LayoutError> {
        check_size(Region::Flush, flush_size)?;
        check_size(Region::ProbeZero, probe_size)?;

        let cmp_size = probe_size;
        let train_probe_size = TRAIN_PROBE_SIZE;

        let too_large = LayoutError::TooLarge { total: usize::MAX };
        let flush_base = 0;
        let cmp_base = flush_size;
        let probe_base = cmp_base
            .checked_add(cmp_size)
            .and_then(|end| end.checked_add(QUARTER_PAGE_CELLS))
            .ok_or(too_large)?;
        let train_probe_base = probe_size
            .checked_mul(2)
            .and_then(|probes| probes.checked_add(QUARTER_PAGE_CELLS))
            .and_then(|span| probe_base.checked_add(span))
            .ok_or(too_large)?;
        let train_cmp_base = train_probe_base
            .checked_add(train_probe_size)
            .ok_or(too_large)?;

        let total_size = probe_size
            .checked_mul(3)
            .and_then(|probes| probes.checked_add(2 * train_probe_size + PAGE_CELLS))
            .and_then(|rest| rest.checked_add(flush_size))
            .ok_or(too_large)?;

        // Every chain cell holds its index plus one page.
        if total_size > u32::MAX as usize - PAGE_CELLS {
            return Err(LayoutError::TooLarge { total: total_size });
        }
        if flush_size < probe_size {
            log::warn!(
                "flush region ({} cells) smaller than the probe region ({} cells), eviction will be partial",
                flush_size,
                probe_size
            );
        }

        Ok(ArenaLayout {
            flush_base,
            flush_size,
            cmp_base,
            cmp_size,
            probe_base,
            probe_size,
            train_probe_base,
            train_probe_size,
            train_cmp_base,
            total_size,
        })
    }

    /// Distance between a bit-0 probe cell and the matching bit-1 cell.
    pub fn probe_half_stride(&self) -> usize {
        self.probe_size + HALF_PAGE_CELLS
    }

    pub fn probe_one_base(&self) -> usize {
        self.probe_base + self.probe_half_stride()
    }

    pub fn flush(&self) -> Range<usize> {
        self.flush_base..self.flush_base + self.flush_size
    }

    pub fn compare(&self) -> Range<usize> {
        self.cmp_base..self.cmp_base + self.cmp_size
    }

    /// Chain range of the bit-0 probe half.
    pub fn probe_zero(&self) -> Range<usize> {
        self.probe_base..self.probe_base + self.probe_size
    }

    /// Chain range of the bit-1 probe half.
    pub fn probe_one(&self) -> Range<usize> {
        self.probe_one_base()..self.probe_base + 2 * self.probe_size
    }

    pub fn train_probe(&self) -> Range<usize> {
        self.train_probe_base..self.train_probe_base + self.train_probe_size
    }

    pub fn region_base(&self, region: Region) -> usize {
        match region {
            Region::Flush => self.flush_base,
            Region::Compare => self.cmp_base,
            Region::ProbeZero => self.probe_base,
            Region::ProbeOne => self.probe_one_base(),
            Region::TrainProbe => self.train_probe_base,
            Region::TrainCompare => self.train_cmp_base,
        }
    }

    /// Number of pages (chain hops) in one probe half.
    pub fn probe_pages(&self) -> usize {
        self.probe_size / PAGE_CELLS
    }

    pub fn flush_pages(&self) -> usize {
        self.flush_size / PAGE_CELLS
    }

    /// Cache-set class of a cell offset: address bits 6..11.
    pub fn set_class(offset: usize) -> usize {
        (offset % PAGE_CELLS) / LINE_CELLS
    }

    pub fn region_set_class(&self, region: Region) -> usize {
        Self::set_class(self.region_base(region))
    }

    /// Content of cell `index` in a freshly built arena.
    pub fn initial_value(&self, index: usize) -> u32 {
        let chained = self.flush().contains(&index)
            || self.compare().contains(&index)
            || (self.probe_base..self.probe_base + 2 * self.probe_size).contains(&index)
            || (self.train_probe_base..self.train_probe_base + 2 * self.train_probe_size)
                .contains(&index);
        if index == self.train_cmp_base || !chained {
            0
        } else {
            (index + PAGE_CELLS) as u32
        }
    }
}

/// The trial arena: one page-aligned mapping laid out by an `ArenaLayout`.
#[derive(Debug)]
pub struct Arena {
    layout: ArenaLayout,
    memory: MMappedMemory<u32>,
}

impl Arena {
    pub fn new(layout: ArenaLayout, huge_pages: bool) -> Result<Arena, ArenaError> {
        let memory = MMappedMemory::new_with_fallback(layout.total_size, huge_pages, |i| {
            layout.initial_value(i)
        })?;
        log::debug!(
            "arena of {} cells mapped at {:p}",
            layout.total_size,
            memory.as_ptr()
        );
        Ok(Arena { layout, memory })
    }

    pub fn with_sizes(flush_size: usize, probe_size: usize) -> Result<Arena, ArenaError> {
        Arena::new(ArenaLayout::new(flush_size, probe_size)?, false)
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn cells(&self) -> &[u32] {
        self.memory.slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{walk_chain, VolatileAccess};

    #[test]
    fn regions_use_distinct_set_classes() {
        for flush_pages in [1, 2, 8, 13, 64] {
            for probe_pages in [1, 3, 8, 32, 512] {
                let layout =
                    ArenaLayout::new(flush_pages * PAGE_CELLS, probe_pages * PAGE_CELLS).unwrap();
                let zero = layout.region_set_class(Region::ProbeZero);
                let one = layout.region_set_class(Region::ProbeOne);
                let cmp = layout.region_set_class(Region::Compare);
                let train = layout.region_set_class(Region::TrainProbe);
                assert_ne!(zero, one);
                assert_ne!(zero, cmp);
                assert_ne!(one, cmp);
                assert_ne!(train, zero);
                assert_ne!(train, one);
                assert_ne!(train, cmp);
                assert_eq!(
                    layout.region_set_class(Region::TrainCompare),
                    train,
                    "training cells share their own class"
                );
                // The evictor touches exactly the classes of the regions it must evict.
                assert_eq!(ArenaLayout::set_class(EVICT_COMPARE_OFFSET), cmp);
                assert_eq!(ArenaLayout::set_class(EVICT_PROBE_ZERO_OFFSET), zero);
                assert_eq!(ArenaLayout::set_class(EVICT_PROBE_ONE_OFFSET), one);
            }
        }
    }

    #[test]
    fn probe_halves_differ_in_bit_11() {
        let layout = ArenaLayout::new(8 * PAGE_CELLS, 8 * PAGE_CELLS).unwrap();
        let zero = layout.probe_base * 4;
        let one = layout.probe_one_base() * 4;
        assert_eq!((zero ^ one) & 0xfff, 1 << 11);
    }

    #[test]
    fn regions_do_not_overlap() {
        let layout = ArenaLayout::new(2 * PAGE_CELLS, 4 * PAGE_CELLS).unwrap();
        assert!(layout.flush().end <= layout.compare().start);
        assert!(layout.compare().end <= layout.probe_zero().start);
        assert!(layout.probe_zero().end <= layout.probe_one().start);
        assert!(layout.probe_one().end <= layout.train_probe().start);
        assert!(layout.train_probe().end <= layout.train_cmp_base);
        assert!(layout.train_cmp_base < layout.total_size);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        assert_eq!(
            ArenaLayout::new(0, PAGE_CELLS),
            Err(LayoutError::Empty { region: Region::Flush })
        );
        assert_eq!(
            ArenaLayout::new(PAGE_CELLS, 0),
            Err(LayoutError::Empty { region: Region::ProbeZero })
        );
        assert_eq!(
            ArenaLayout::new(PAGE_CELLS, 1000),
            Err(LayoutError::NotPageMultiple { region: Region::ProbeZero, size: 1000 })
        );
        assert_eq!(
            ArenaLayout::new(PAGE_CELLS + 16, PAGE_CELLS),
            Err(LayoutError::NotPageMultiple { region: Region::Flush, size: PAGE_CELLS + 16 })
        );
        assert!(matches!(
            ArenaLayout::new(1 << 32, PAGE_CELLS),
            Err(LayoutError::TooLarge { .. })
        ));
    }

    #[test]
    fn overflowing_sizes_are_too_large() {
        assert_eq!(
            ArenaLayout::new(usize::MAX - (PAGE_CELLS - 1), PAGE_CELLS),
            Err(LayoutError::TooLarge { total: usize::MAX })
        );
        assert_eq!(
            ArenaLayout::new(PAGE_CELLS, usize::MAX - (PAGE_CELLS - 1)),
            Err(LayoutError::TooLarge { total: usize::MAX })
        );
    }

    #[test]
    fn arena_chains_visit_one_cell_per_page() {
        let arena = Arena::with_sizes(4 * PAGE_CELLS, 4 * PAGE_CELLS).unwrap();
        let layout = *arena.layout();
        let cells = arena.cells();
        assert_eq!(cells[layout.train_cmp_base], 0);
        assert!(layout.compare().all(|i| cells[i] > 1000));

        let mut hops = 0;
        let mut idx = layout.probe_one().start;
        while idx < layout.probe_one().end {
            assert_eq!(ArenaLayout::set_class(idx), layout.region_set_class(Region::ProbeOne));
            idx = cells[idx] as usize;
            hops += 1;
        }
        assert_eq!(hops, layout.probe_pages());

        let mut access = VolatileAccess;
        let end = walk_chain(&mut access, cells, layout.probe_base, layout.probe_zero().end);
        assert_eq!(end, layout.probe_zero().end);
    }
}
